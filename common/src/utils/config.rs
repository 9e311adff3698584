use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    /// External HTTP embedding service (OpenAI-compatible).
    Openai,
    /// Deterministic feature-hashed embeddings, for tests and offline runs.
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackendKind {
    EmbeddingBackendKind::Openai
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackendKind,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_max_concurrency: usize,
    #[serde(default = "default_embedding_batch")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_cache")]
    pub embedding_cache_capacity: usize,
    /// Optional requests-per-minute cap on the embedding service.
    #[serde(default)]
    pub embedding_rpm: Option<u32>,

    #[serde(default = "default_ingest_batch_max")]
    pub ingest_batch_max: usize,
    #[serde(default = "default_ingest_flush_secs")]
    pub ingest_flush_interval_secs: u64,

    #[serde(default = "default_session_min_score")]
    pub session_search_min_score: f32,
    #[serde(default = "default_process_min_score")]
    pub process_min_score: f32,
    #[serde(default = "default_document_threshold")]
    pub document_score_threshold: f32,
    #[serde(default = "default_document_cap")]
    pub document_safety_cap: usize,

    #[serde(default = "default_turn_deadline")]
    pub turn_deadline_secs: u64,
    #[serde(default = "default_synthesis_deadline")]
    pub synthesis_deadline_secs: u64,
    #[serde(default = "default_llm_idle_timeout")]
    pub llm_idle_timeout_secs: u64,
    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_store_query_timeout")]
    pub store_query_timeout_secs: u64,

    #[serde(default = "default_send_buffer")]
    pub send_buffer_size: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Whether a `message` arriving mid-turn is queued instead of rejected.
    #[serde(default)]
    pub queue_turns: bool,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_dimensions() -> usize {
    1024
}

fn default_embedding_concurrency() -> usize {
    8
}

fn default_embedding_batch() -> usize {
    32
}

fn default_embedding_cache() -> usize {
    10_000
}

fn default_ingest_batch_max() -> usize {
    10
}

fn default_ingest_flush_secs() -> u64 {
    5
}

fn default_session_min_score() -> f32 {
    0.5
}

fn default_process_min_score() -> f32 {
    0.5
}

fn default_document_threshold() -> f32 {
    0.6
}

fn default_document_cap() -> usize {
    200
}

fn default_turn_deadline() -> u64 {
    120
}

fn default_synthesis_deadline() -> u64 {
    30
}

fn default_llm_idle_timeout() -> u64 {
    45
}

fn default_embed_timeout() -> u64 {
    30
}

fn default_store_query_timeout() -> u64 {
    5
}

fn default_send_buffer() -> usize {
    64
}

fn default_send_timeout() -> u64 {
    10
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_optional_knobs() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "openai_api_key": "k",
            "surrealdb_address": "mem://",
            "surrealdb_username": "root",
            "surrealdb_password": "root",
            "surrealdb_namespace": "ns",
            "surrealdb_database": "db",
            "http_port": 3000
        }))
        .expect("minimal config deserializes");

        assert_eq!(config.embedding_dimensions, 1024);
        assert_eq!(config.embedding_max_concurrency, 8);
        assert_eq!(config.embedding_batch_size, 32);
        assert_eq!(config.ingest_batch_max, 10);
        assert_eq!(config.ingest_flush_interval_secs, 5);
        assert_eq!(config.send_buffer_size, 64);
        assert_eq!(config.turn_deadline_secs, 120);
        assert!(config.embedding_rpm.is_none());
        assert!(!config.queue_turns);
        assert_eq!(config.embedding_backend, EmbeddingBackendKind::Openai);
    }
}
