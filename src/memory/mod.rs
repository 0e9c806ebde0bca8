pub mod pool;

pub use pool::MemoryPool;
