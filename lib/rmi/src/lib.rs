//! Block manager: a content-addressed, torrent-style exchange for serialized byte blocks between
//! peers (spec.md §4.2), layered on `net`'s service dispatch.

pub mod blocks;
pub mod error;
pub mod worker;

pub use blocks::{BlockManager, BlockSpec};
pub use error::{BlockError, Result};
pub use worker::{ExecutorService, RemoteWorker, TaskHandler, TaskRegistry};
