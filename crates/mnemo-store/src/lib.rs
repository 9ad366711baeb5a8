pub mod error;
pub mod pool;
pub mod schema;
pub mod vector;

pub use error::StoreError;
pub use pool::StorePool;
