use std::sync::Arc;

use temanjalan_domain::ports::conversations::ConversationClient;
use temanjalan_domain::ports::db::DbAdapter;
use temanjalan_domain::ports::matching::MatchStore;
use temanjalan_domain::ports::profiles::ProfileRepository;
use temanjalan_infra::chat_client::ChatApiClient;
use temanjalan_infra::config::AppConfig;
use temanjalan_infra::db::{DbConfig, MemoryAdapter, SurrealAdapter};
use temanjalan_infra::stores::{
    InMemoryMatchStore, InMemoryProfileRepository, LocalConversationClient, SurrealMatchStore,
    SurrealProfileRepository,
};

/// Explicit dependency wiring: every collaborator enters handlers through
/// this state, lifecycle owned by the process entry point.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<dyn DbAdapter>,
    pub match_store: Arc<dyn MatchStore>,
    pub profile_repo: Arc<dyn ProfileRepository>,
    pub conversations: Arc<dyn ConversationClient>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        if config.data_backend.eq_ignore_ascii_case("surreal")
            || config.data_backend.eq_ignore_ascii_case("surrealdb")
        {
            let db_config = DbConfig::from_app_config(&config);
            let match_store = Arc::new(SurrealMatchStore::new(&db_config).await?);
            let profile_repo = Arc::new(SurrealProfileRepository::new(&db_config).await?);
            let conversations = Arc::new(ChatApiClient::from_config(&config));
            let db = Arc::new(SurrealAdapter::new(db_config));
            return Ok(Self {
                config,
                db,
                match_store,
                profile_repo,
                conversations,
            });
        }

        Ok(Self::with_stores(
            config,
            Arc::new(InMemoryMatchStore::new()),
            Arc::new(InMemoryProfileRepository::new()),
            Arc::new(LocalConversationClient::new()),
            Arc::new(MemoryAdapter),
        ))
    }

    pub fn with_stores(
        config: AppConfig,
        match_store: Arc<dyn MatchStore>,
        profile_repo: Arc<dyn ProfileRepository>,
        conversations: Arc<dyn ConversationClient>,
        db: Arc<dyn DbAdapter>,
    ) -> Self {
        Self {
            config,
            db,
            match_store,
            profile_repo,
            conversations,
        }
    }
}
