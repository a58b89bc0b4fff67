use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};
use tracing::warn;

/// Number of random bytes in an owner token (hex encoded to 32 chars).
const TOKEN_BYTES: usize = 16;

/// Generate a lease owner token.
///
/// Uses the operating system CSPRNG. If it is unavailable, falls back to a
/// token built from the current time and process id, which is unique per
/// process but guessable.
pub fn generate_owner_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!(error = %e, "secure randomness unavailable, using fallback lock token");
            fallback_token()
        }
    }
}

fn fallback_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{nanos}-{}", std::process::id())
}
