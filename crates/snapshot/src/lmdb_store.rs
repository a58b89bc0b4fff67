use std::path::Path;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use parking_lot::RwLock;
use tracing::debug;

use keel_cache::error::CacheError;

use crate::store::{DurableStore, Record};

const SNAPSHOT_DB: &str = "snapshot";

fn persistence(op: &str, e: lmdb::Error) -> CacheError {
    CacheError::Persistence(format!("{op}: {e}"))
}

/// [`DurableStore`] backed by a single named LMDB database.
pub struct LmdbStore {
    inner: RwLock<Option<(Environment, Database)>>,
}

impl LmdbStore {
    /// Open (creating if needed) the environment at `path`.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, CacheError> {
        std::fs::create_dir_all(path).map_err(|e| {
            CacheError::Persistence(format!("create {}: {e}", path.display()))
        })?;

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size)
            .open(path)
            .map_err(|e| persistence("open environment", e))?;
        let db = env
            .create_db(Some(SNAPSHOT_DB), DatabaseFlags::empty())
            .map_err(|e| persistence("open database", e))?;

        debug!(path = %path.display(), "opened snapshot store");
        Ok(Self {
            inner: RwLock::new(Some((env, db))),
        })
    }

    fn with_env<T>(
        &self,
        f: impl FnOnce(&Environment, Database) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let guard = self.inner.read();
        let (env, db) = guard
            .as_ref()
            .ok_or_else(|| CacheError::Closed("snapshot store".into()))?;
        f(env, *db)
    }
}

impl DurableStore for LmdbStore {
    fn write_batch(&self, records: &[Record]) -> Result<(), CacheError> {
        self.with_env(|env, db| {
            let mut txn = env
                .begin_rw_txn()
                .map_err(|e| persistence("begin write", e))?;
            for (key, value) in records {
                txn.put(db, key, value, WriteFlags::empty())
                    .map_err(|e| persistence("put", e))?;
            }
            txn.commit().map_err(|e| persistence("commit", e))
        })
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.with_env(|env, db| {
            let mut txn = env
                .begin_rw_txn()
                .map_err(|e| persistence("begin clear", e))?;
            txn.clear_db(db).map_err(|e| persistence("clear", e))?;
            txn.commit().map_err(|e| persistence("commit clear", e))
        })
    }

    fn scan(&self) -> Result<Vec<Record>, CacheError> {
        self.with_env(|env, db| {
            let txn = env
                .begin_ro_txn()
                .map_err(|e| persistence("begin read", e))?;
            let mut cursor = txn
                .open_ro_cursor(db)
                .map_err(|e| persistence("open cursor", e))?;

            // An unpositioned cursor starts at the first record; an empty
            // database yields nothing.
            let records: Vec<Record> = cursor
                .iter()
                .map(|(key, value)| (key.to_vec(), value.to_vec()))
                .collect();
            Ok(records)
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        self.with_env(|env, db| {
            let txn = env
                .begin_ro_txn()
                .map_err(|e| persistence("begin read", e))?;
            match txn.get(db, &key) {
                Ok(bytes) => Ok(Some(bytes.to_vec())),
                Err(lmdb::Error::NotFound) => Ok(None),
                Err(e) => Err(persistence("get", e)),
            }
        })
    }

    fn close(&self) -> Result<(), CacheError> {
        if let Some((env, _db)) = self.inner.write().take() {
            env.sync(true).map_err(|e| persistence("sync", e))?;
        }
        Ok(())
    }
}
