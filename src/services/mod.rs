pub mod auth;
pub mod chat;
pub mod conversation;
pub mod database;
pub mod images;
pub mod preferences;
pub mod storage;
pub mod tasks;
pub mod title;
pub mod validation;

pub use chat::ChatService;
pub use conversation::ConversationStore;
pub use database::Database;
pub use images::ImageService;
pub use preferences::PreferencesService;
pub use storage::ObjectStore;
pub use tasks::TaskQueue;
pub use title::TitleGenerator;
