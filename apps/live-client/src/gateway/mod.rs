pub mod connection;
pub mod events;
pub mod rooms;
pub mod router;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use events::{PushEvent, PushKind};
pub use router::{EventRouter, PushHandler};
