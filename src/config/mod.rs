//! Configuration system
//!
//! Handles loading configuration from multiple sources:
//! - Global config (~/.config/vetta/config.toml)
//! - Project config (./vetta.toml or .vetta/config.toml)
//! - Environment variables (INTERVIEW_MAX_DURATION, POLLING_INTERVAL, ...)
//!
//! Every option has a safe default; configuration errors are surfaced
//! before a session starts, never mid-interview.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session deadline, seconds
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Code monitor cadence, seconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Seconds of editor stasis before a nudge
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,

    /// Confidence cutoff for lie promotion, [0,1]
    #[serde(default = "default_lie_threshold")]
    pub lie_threshold: f64,

    /// Trailing silence to commit a candidate turn, milliseconds
    #[serde(default = "default_end_of_turn_silence")]
    pub end_of_turn_silence_ms: u64,

    /// Threshold to play a filler phrase during an LLM wait, milliseconds
    #[serde(default = "default_filler_latency")]
    pub filler_latency_threshold_ms: u64,

    /// Upper bound on one LLM call, seconds
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,

    /// Retries on LLM schema mismatch
    #[serde(default = "default_llm_schema_retries")]
    pub llm_schema_retries: u32,

    /// Cap on any single external I/O operation, seconds
    #[serde(default = "default_external_timeout")]
    pub external_timeout_secs: u64,

    /// Per-task flush budget on cancel, seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Template for the remote editor URL, with `{question_id}` and
    /// `{session_id}` placeholders
    #[serde(default = "default_editor_url_template")]
    pub editor_url_template: String,

    /// Where ingestion artifacts and outcomes live
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    #[serde(default)]
    pub editor: EditorConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration(),
            polling_interval_secs: default_polling_interval(),
            inactivity_threshold_secs: default_inactivity_threshold(),
            lie_threshold: default_lie_threshold(),
            end_of_turn_silence_ms: default_end_of_turn_silence(),
            filler_latency_threshold_ms: default_filler_latency(),
            llm_timeout_secs: default_llm_timeout(),
            llm_schema_retries: default_llm_schema_retries(),
            external_timeout_secs: default_external_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            editor_url_template: default_editor_url_template(),
            data_root: default_data_root(),
            editor: EditorConfig::default(),
            speech: SpeechConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

fn default_max_duration() -> u64 {
    1800
}
fn default_polling_interval() -> u64 {
    5
}
fn default_inactivity_threshold() -> u64 {
    15
}
fn default_lie_threshold() -> f64 {
    0.7
}
fn default_end_of_turn_silence() -> u64 {
    700
}
fn default_filler_latency() -> u64 {
    800
}
fn default_llm_timeout() -> u64 {
    20
}
fn default_llm_schema_retries() -> u32 {
    2
}
fn default_external_timeout() -> u64 {
    15
}
fn default_shutdown_grace() -> u64 {
    3
}
fn default_editor_url_template() -> String {
    "http://localhost:3000/coding-engine?question={question_id}&session={session_id}".to_string()
}
fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

/// Remote editor surface settings. The selectors are configuration, not
/// code, so a UI revision only touches this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    /// WebDriver endpoint driving the browser session
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// CSS selector for the editor textarea
    #[serde(default = "default_editor_selector")]
    pub editor_selector: String,

    /// CSS selector for the submit button
    #[serde(default = "default_submit_selector")]
    pub submit_selector: String,

    /// CSS selector for the test result region
    #[serde(default = "default_test_result_selector")]
    pub test_result_selector: String,

    /// Per-poll timeout, seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            editor_selector: default_editor_selector(),
            submit_selector: default_submit_selector(),
            test_result_selector: default_test_result_selector(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}
fn default_editor_selector() -> String {
    "textarea.inputarea".to_string()
}
fn default_submit_selector() -> String {
    "[data-testid='submit-button']".to_string()
}
fn default_test_result_selector() -> String {
    "[data-testrunner]".to_string()
}
fn default_poll_timeout() -> u64 {
    2
}

/// Speech transport settings (STT and TTS stream endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// STT streaming endpoint (WebSocket)
    #[serde(default = "default_stt_url")]
    pub stt_url: String,

    /// TTS streaming endpoint (WebSocket)
    #[serde(default = "default_tts_url")]
    pub tts_url: String,

    /// STT model identifier passed to the provider
    #[serde(default = "default_stt_model")]
    pub stt_model: String,

    /// TTS voice/model identifier passed to the provider
    #[serde(default = "default_tts_model")]
    pub tts_model: String,

    /// Audio sample rate
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Filler phrases played while the model is thinking
    #[serde(default = "default_filler_pool")]
    pub filler_pool: Vec<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stt_url: default_stt_url(),
            tts_url: default_tts_url(),
            stt_model: default_stt_model(),
            tts_model: default_tts_model(),
            sample_rate: default_sample_rate(),
            filler_pool: default_filler_pool(),
        }
    }
}

fn default_stt_url() -> String {
    "ws://localhost:8090/v1/listen".to_string()
}
fn default_tts_url() -> String {
    "ws://localhost:8090/v1/speak".to_string()
}
fn default_stt_model() -> String {
    "nova-3".to_string()
}
fn default_tts_model() -> String {
    "aura-2-thalia-en".to_string()
}
fn default_sample_rate() -> u32 {
    24000
}
fn default_filler_pool() -> Vec<String> {
    vec![
        "Let me think about that.".to_string(),
        "One moment.".to_string(),
        "Hmm, okay.".to_string(),
        "Right, give me a second.".to_string(),
    ]
}

/// LLM provider settings
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API key (can also be set via VETTA_LLM_API_KEY)
    pub api_key: Option<String>,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_llm_base_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-oss-120b".to_string()
}
fn default_llm_temperature() -> f32 {
    1.0
}
fn default_llm_max_tokens() -> usize {
    8192
}

impl Config {
    /// Load configuration from all sources (global, project, env)
    pub async fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let content = fs::read_to_string(&global_path).await?;
                config = toml::from_str(&content)
                    .with_context(|| format!("Invalid config at {}", global_path.display()))?;
            }
        }

        for name in ["vetta.toml", ".vetta/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                config = toml::from_str(&content)
                    .with_context(|| format!("Invalid config at {}", path.display()))?;
            }
        }

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Get the global config file path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "vetta", "vetta-agent")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        if let Some(v) = env_u64("INTERVIEW_MAX_DURATION") {
            self.max_duration_secs = v;
        }
        if let Some(v) = env_u64("POLLING_INTERVAL") {
            self.polling_interval_secs = v;
        }
        if let Some(v) = env_u64("INACTIVITY_THRESHOLD") {
            self.inactivity_threshold_secs = v;
        }
        if let Some(v) = env_f64("LIE_THRESHOLD") {
            self.lie_threshold = v;
        }
        if let Some(v) = env_u64("END_OF_TURN_SILENCE") {
            self.end_of_turn_silence_ms = v;
        }
        if let Some(v) = env_u64("FILLER_LATENCY_THRESHOLD") {
            self.filler_latency_threshold_ms = v;
        }
        if let Some(v) = env_u64("LLM_TIMEOUT") {
            self.llm_timeout_secs = v;
        }
        if let Some(v) = env_u64("LLM_SCHEMA_RETRIES") {
            self.llm_schema_retries = v as u32;
        }
        if let Some(v) = env_u64("EXTERNAL_TIMEOUT") {
            self.external_timeout_secs = v;
        }
        if let Some(v) = env_u64("SHUTDOWN_GRACE") {
            self.shutdown_grace_secs = v;
        }
        if let Ok(v) = std::env::var("EDITOR_URL_TEMPLATE") {
            self.editor_url_template = v;
        }
        if let Ok(v) = std::env::var("DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VETTA_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VETTA_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("VETTA_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("VETTA_STT_URL") {
            self.speech.stt_url = v;
        }
        if let Ok(v) = std::env::var("VETTA_TTS_URL") {
            self.speech.tts_url = v;
        }
        if let Ok(v) = std::env::var("VETTA_WEBDRIVER_URL") {
            self.editor.webdriver_url = v;
        }
    }

    /// Fail-fast validation of the loaded configuration
    pub fn validate(&self) -> Result<()> {
        if !self.editor_url_template.contains("{question_id}")
            || !self.editor_url_template.contains("{session_id}")
        {
            anyhow::bail!(
                "EDITOR_URL_TEMPLATE must contain {{question_id}} and {{session_id}} placeholders: {}",
                self.editor_url_template
            );
        }
        if !(0.0..=1.0).contains(&self.lie_threshold) {
            anyhow::bail!("LIE_THRESHOLD must be in [0,1]: {}", self.lie_threshold);
        }
        if self.polling_interval_secs == 0 {
            anyhow::bail!("POLLING_INTERVAL must be positive");
        }
        for (name, value) in [
            ("editor.webdriver_url", &self.editor.webdriver_url),
            ("speech.stt_url", &self.speech.stt_url),
            ("speech.tts_url", &self.speech.tts_url),
            ("llm.base_url", &self.llm.base_url),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{name} must not be empty");
            }
        }
        if self.speech.filler_pool.is_empty() {
            anyhow::bail!("speech.filler_pool must not be empty");
        }
        Ok(())
    }

    /// Expand the editor URL template for a question within a session
    pub fn editor_url(&self, question_id: &str, session_id: &str) -> String {
        self.editor_url_template
            .replace("{question_id}", question_id)
            .replace("{session_id}", session_id)
    }

    /// Directory holding per-session state and outputs
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_root.join("sessions").join(session_id)
    }

    /// Directory holding ingestion artifacts for a candidate
    pub fn ingest_dir(&self, candidate_id: &str) -> PathBuf {
        self.data_root.join("ingest").join(candidate_id)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    pub fn end_of_turn_silence(&self) -> Duration {
        Duration::from_millis(self.end_of_turn_silence_ms)
    }

    pub fn filler_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.filler_latency_threshold_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.editor.poll_timeout_secs)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring unparsable env override");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_f64(name: &str) -> Option<f64> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring unparsable env override");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.max_duration_secs, 1800);
        assert_eq!(config.polling_interval_secs, 5);
        assert_eq!(config.end_of_turn_silence_ms, 700);
        assert_eq!(config.llm_schema_retries, 2);
    }

    #[test]
    fn url_template_expansion() {
        let config = Config::default();
        let url = config.editor_url("q-17", "sess-abc");
        assert!(url.contains("question=q-17"));
        assert!(url.contains("session=sess-abc"));
    }

    #[test]
    fn template_without_placeholders_rejected() {
        let config = Config {
            editor_url_template: "http://localhost:3000/editor".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lie_threshold_out_of_range_rejected() {
        let config = Config {
            lie_threshold: 1.3,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_selectors() {
        let mut config = Config::default();
        config.editor.editor_selector = ".monaco-editor textarea".to_string();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.editor.editor_selector, ".monaco-editor textarea");
    }
}
