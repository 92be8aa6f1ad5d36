pub mod adapter;
pub mod error;
pub mod event;

pub use adapter::{MemoryQueueAdapter, PulledBatch, QueueAdapter};
pub use error::{CoreError, Result};
pub use event::{StreamEvent, StreamId};
