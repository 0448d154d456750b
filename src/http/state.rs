use std::sync::Arc;

use crate::config::AppConfig;
use crate::providers::openai::OpenAiProvider;
use crate::providers::ProviderRouter;
use crate::services::auth::TokenVerifier;
use crate::services::{
    ChatService, ConversationStore, Database, ImageService, ObjectStore, PreferencesService, TaskQueue,
    TitleGenerator,
};

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub verifier: TokenVerifier,
    pub router: Arc<ProviderRouter>,
    pub store: ConversationStore,
    pub files: ObjectStore,
    pub preferences: PreferencesService,
    pub chat: ChatService,
    pub images: Arc<ImageService>,
    pub tasks: TaskQueue,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database, router: Arc<ProviderRouter>, client: reqwest::Client) -> Self {
        let store = ConversationStore::new(db.clone());
        let files = ObjectStore::new(db.clone(), config.public_base_url.clone(), config.limits.max_image_size);
        let tasks = TaskQueue::new();
        let titles = TitleGenerator::new(router.clone(), store.clone(), config.title_model.clone());
        let chat = ChatService::new(
            store.clone(),
            files.clone(),
            titles,
            tasks.clone(),
            router.clone(),
            config.limits.clone(),
            config.system_prompt.clone(),
        );
        let images = ImageService::new(
            OpenAiProvider::new(client),
            config.openai.clone(),
            store.clone(),
            files.clone(),
        );

        Self {
            verifier: TokenVerifier::new(&config.jwt_secret),
            preferences: PreferencesService::new(db.clone()),
            config: Arc::new(config),
            db,
            router,
            store,
            files,
            chat,
            images: Arc::new(images),
            tasks,
        }
    }
}
