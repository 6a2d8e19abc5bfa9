pub mod app;
pub mod chat;
pub mod controller;
pub mod observer;
pub mod settings;
pub mod store;

pub use app::{
    ChatClient, ClientError, ClientOptions, ClientResult, SendOutcome, SendRejection, auto_title,
};
pub use chat::{Message, MessageStatus, Role, Session, StatusRejection};
pub use controller::{MessageUpdate, StreamSession, StreamStep};
pub use observer::{ChatObserver, NoopObserver};
pub use settings::{ChatSettings, PersistenceSettings, SettingsError, SettingsStore};
pub use store::{ChatStore, DeletedSession};
