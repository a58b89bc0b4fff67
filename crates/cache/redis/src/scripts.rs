/// Set a lease key only if absent (SET NX PX).
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner token
/// ARGV\[2\] = TTL in milliseconds
///
/// Returns 1 if set, 0 if the key already exists.
pub const LOCK_ACQUIRE: &str = r"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
if ok then
    return 1
end
return 0
";

/// Delete a lease key only if it still holds the caller's token.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner token
///
/// Returns 1 if deleted, 0 if missing or owned by someone else.
pub const LOCK_RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Reset a lease's TTL only if it still holds the caller's token.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner token
/// ARGV\[2\] = new TTL in milliseconds
///
/// Returns 1 if extended, 0 if missing or owned by someone else.
pub const LOCK_EXTEND: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";
