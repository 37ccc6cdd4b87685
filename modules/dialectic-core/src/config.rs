use anyhow::Result;

/// Application configuration loaded from environment variables.
/// Contains only secrets and env-specific values; worker, queue and
/// dedup tunables live in the TOML FileConfig.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,

    // Discourse engine
    pub discourse_engine_url: String,
    pub discourse_engine_api_key: Option<String>,

    // Identity of this worker process in queue leases
    pub worker_id: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")?,
            discourse_engine_url: std::env::var("DISCOURSE_ENGINE_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            discourse_engine_api_key: std::env::var("DISCOURSE_ENGINE_API_KEY").ok(),
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            format!("{}...({} chars)", &val[..n], val.len())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!("  DISCOURSE_ENGINE_URL: {}", self.discourse_engine_url);
        tracing::info!(
            "  DISCOURSE_ENGINE_API_KEY: {}",
            preview_opt(&self.discourse_engine_api_key)
        );
        tracing::info!("  WORKER_ID: {}", self.worker_id);
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}
