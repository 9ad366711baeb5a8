use std::sync::Once;

use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{classify, StoreError};
use crate::schema;

/// Registers the sqlite-vec extension globally (once per process).
/// Must run before any SQLite connection is opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init has the signature sqlite3_auto_extension
        // expects; the pointer targets a statically linked symbol that lives
        // for the whole process.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
        debug!("sqlite-vec extension registered globally");
    });
}

/// Async SQLite pool. The sole surface that touches persistent storage;
/// everything else goes through [`StorePool::run`].
#[derive(Clone)]
pub struct StorePool {
    pool: Pool,
}

impl StorePool {
    /// Open (or create) a database file and build the pool around it.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        ensure_sqlite_vec_registered();
        let pool = Config::new(path)
            .create_pool(Runtime::Tokio1)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. The shared-cache URI makes every pooled
    /// connection see the same data.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let uri = format!(
            "file:mnemo_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::open(&uri)
    }

    /// Apply the idempotent schema. Safe to call on every startup.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.run(|conn| schema::init_schema(conn)).await
    }

    /// Run a closure against a pooled connection on a blocking worker.
    ///
    /// The connection is returned to the pool on every exit path, including
    /// panics inside the closure (deadpool recycles the object). Connection
    /// and pool failures map to `Unavailable`; rusqlite errors are classified
    /// into the taxonomy.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let obj = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        obj.interact(move |conn| f(conn))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map_err(classify)
    }

    /// Run a closure inside a transaction: commit on `Ok`, roll back on `Err`
    /// or panic. Use for every mutation that spans more than one table.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Close the pool. Idempotent; outstanding connections are dropped once
    /// their current closure finishes.
    pub fn close(&self) {
        self.pool.close();
    }
}
