//! Threaded Q&A: per-event boards and the question → answers projection.

pub mod model;
pub mod projection;
pub mod roster;

pub use model::{PendingMessage, PendingStatus, ThreadModel};
pub use projection::{derive_threads, Thread, ThreadView};
