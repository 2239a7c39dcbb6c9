use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub jwt_secret: String,
    pub auth_dev_bypass_enabled: bool,
    pub chat_api_base_url: String,
    pub chat_api_token: String,
    pub chat_api_timeout_ms: u64,
    pub chat_api_retry_max_attempts: u32,
    pub chat_api_retry_backoff_base_ms: u64,
    pub chat_api_retry_backoff_max_ms: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "temanjalan")?
            .set_default("surreal_db", "match")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("auth_dev_bypass_enabled", false)?
            .set_default("chat_api_base_url", "http://127.0.0.1:9100/api/v1")?
            .set_default("chat_api_token", "")?
            .set_default("chat_api_timeout_ms", 2_500)?
            .set_default("chat_api_retry_max_attempts", 3)?
            .set_default("chat_api_retry_backoff_base_ms", 200)?
            .set_default("chat_api_retry_backoff_max_ms", 2_000)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}
