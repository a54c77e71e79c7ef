//! Env-driven `EngineConfig` (SPEC_FULL.md §3 Ambient stack): scoped to
//! process environment only, no on-disk layered config, mirroring
//! `tandem-core::config::ConfigStore`'s layering philosophy at the much
//! smaller surface this system needs.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub temporal_host: String,
    pub temporal_namespace: String,
    pub temporal_task_queue: String,
    pub api_host: String,
    pub api_port: u16,
    pub log_level: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            temporal_host: std::env::var("TEMPORAL_HOST").unwrap_or_else(|_| "localhost:7233".to_string()),
            temporal_namespace: std::env::var("TEMPORAL_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            temporal_task_queue: std::env::var("TEMPORAL_TASK_QUEUE").unwrap_or_else(|_| "man-mode".to_string()),
            api_host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: std::env::var("API_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}
