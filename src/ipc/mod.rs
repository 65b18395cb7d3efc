//! Inter-process communication: per-process message queues and the global
//! message-type registry.

pub mod messages;

pub use messages::{Message, MessageDetails, MessageQueue};
