mod pool;

pub use pool::ObjectPool;
