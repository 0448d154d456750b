pub mod attachment;
pub mod conversation;
pub mod message;
pub mod provider;
pub mod user;

pub use attachment::StoredFile;
pub use conversation::{Conversation, DEFAULT_CONVERSATION_NAME};
pub use message::{Message, NewMessage, Role};
pub use provider::ProviderId;
pub use user::{Credits, User, UserPreferences};
