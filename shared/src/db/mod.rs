pub mod error;
pub mod memory;
pub mod pool;
pub mod repositories;

pub use error::DatabaseError;
pub use memory::InMemoryStore;
pub use pool::DatabasePool;
