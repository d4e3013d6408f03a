//! Concurrency fabric: supervised worker threads, typed pub/sub feeds,
//! single-slot shared cells, and the drift-free beat scheduler.

pub mod beat;
pub mod feed;
pub mod shared_cell;
pub mod thread_manager;

pub use beat::{Beat, BeatError};
pub use feed::{Feed, FeedRunner};
pub use shared_cell::SharedCell;
pub use thread_manager::ThreadManager;
