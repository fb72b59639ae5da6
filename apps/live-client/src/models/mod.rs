pub mod membership;
pub mod message;
pub mod notification;
pub mod participant;
pub mod room;
