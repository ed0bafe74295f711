use std::env;

/// Process configuration, read from the environment after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string; without it the service keeps state in memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 5),
            port: parse_or("PORT", 8081),
            log_filter: env::var("RUST_LOG")
                .unwrap_or_else(|_| "course_progress_runtime=info,axum=info".into()),
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
