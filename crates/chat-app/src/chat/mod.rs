mod message;

pub use message::{Message, MessageStatus, Role, Session, StatusRejection};
