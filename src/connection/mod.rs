pub mod lock;
pub mod manager;

pub use lock::ConnectionLock;
pub use manager::{AcquireOutcome, BlockStatus, ConnectionManager};
