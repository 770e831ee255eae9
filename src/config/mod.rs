//! TOML configuration for the call orchestrator.
//!
//! Every section is `#[serde(default)]`, so an empty file (or no file at all)
//! yields a working configuration. Credentials are normally supplied through
//! the environment and never serialized back out.
//!
//! ```toml
//! [segmenter]
//! silence_window_ms = 1200
//! min_speech_ms = 450
//!
//! [coordinator]
//! playback_ack_timeout_ms = 8000
//!
//! [[tools]]
//! name = "checkAvailability"
//! description = "Check appointment slots for a doctor"
//! say = "Umm..."
//! endpoint = "http://localhost:8080/tools/check-availability"
//! ```

use crate::error::ConfigError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = ".callturn";
const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_SYSTEM_PROMPT: &str = "You are Eva, a friendly and efficient hospital \
representative from Zuleikha Hospital in the UAE. You help callers book appointments \
and answer questions about the hospital's services. Your replies are converted \
directly to speech: use natural conversational language, no Markdown, and keep \
each reply to two or three short sentences. Always use the current_datetime \
provided in this message when talking about today or now. Check availability \
before asking for an email address, and only book after the slot and email are \
confirmed.";

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub gateway: GatewayConfig,
    pub transcription: TranscriptionConfig,
    pub segmenter: SegmenterConfig,
    pub dialogue: DialogueConfig,
    pub speech: SpeechConfig,
    pub coordinator: CoordinatorConfig,
    pub logging: LoggingConfig,
    /// HTTP-backed tools exposed to the language model.
    pub tools: Vec<HttpToolConfig>,
}

impl Config {
    /// `~/.callturn/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = directories::UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Read, parse and validate a config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.config_path = path.to_path_buf();
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load the default config file if it exists, otherwise fall back to defaults.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            return Self::load(&path);
        }
        tracing::debug!(path = %path.display(), "No config file found, using defaults");
        let mut config = Self {
            config_path: path,
            ..Self::default()
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Fill credentials and logging filter from environment variables.
    ///
    /// The lookup is injected so tests never touch the process environment.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.dialogue.api_key = Some(key);
        }
        if let Some(key) = non_empty("DEEPGRAM_API_KEY") {
            self.transcription.api_key = Some(key);
        }
        if let Some(key) = non_empty("XI_API_KEY") {
            self.speech.api_key = Some(key);
        }
        if let Some(voice) = non_empty("VOICE_ID") {
            self.speech.voice_id = Some(voice);
        }
        if let Some(host) = non_empty("SERVER") {
            self.gateway.public_host = Some(host);
        }
        if let Some(filter) = non_empty("CALLTURN_LOG") {
            self.logging.filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dialogue.timezone()?;

        if self.segmenter.max_pending_frames == 0 {
            return Err(ConfigError::Invalid(
                "segmenter.max_pending_frames must be at least 1".into(),
            ));
        }
        if self.segmenter.max_silent_interim_frames == 0 {
            return Err(ConfigError::Invalid(
                "segmenter.max_silent_interim_frames must be at least 1".into(),
            ));
        }
        if self.coordinator.playback_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.playback_ack_timeout_ms must be positive".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(ConfigError::Invalid("tool name must not be empty".into()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// JSON Schema of the config file, for editors and documentation.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or(serde_json::Value::Null)
    }
}

// ── Gateway ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Public hostname the telephony provider reaches us on; used in the
    /// `<Stream url>` returned from `/incoming`.
    pub public_host: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            public_host: None,
            request_timeout_secs: 30,
        }
    }
}

// ── Transcription ──────────────────────────────────────────────────

/// Live transcription backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Backend-side endpointing hint, in milliseconds.
    pub endpointing_ms: u64,
    pub utterance_end_ms: u64,
    /// Interval for keep-alive messages while no audio is flowing (muted).
    pub keepalive_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_url: "wss://api.deepgram.com/v1/listen".into(),
            api_key: None,
            model: "nova-2-phonecall".into(),
            encoding: "mulaw".into(),
            sample_rate: 8000,
            endpointing_ms: 400,
            utterance_end_ms: 1250,
            keepalive_secs: 5,
        }
    }
}

// ── Segmenter ──────────────────────────────────────────────────────

/// Endpointing and reconnection tunables.
///
/// Historical deployments used anything between 400 and 1500 ms for the
/// silence and minimum-speech windows; tune per carrier and backend.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SegmenterConfig {
    /// No new transcript content for this long finalizes a pending utterance.
    pub silence_window_ms: u64,
    /// No inbound audio for this long is also required by the silence rule.
    /// `0` disables the audio half of the check.
    pub audio_silence_ms: u64,
    /// Minimum time since the buffer became non-empty before silence may
    /// finalize it.
    pub min_speech_ms: u64,
    /// Consecutive empty interim transcripts that count as end of speech.
    pub max_silent_interim_frames: u32,
    /// Audio frames held while the backend is disconnected (20 ms each).
    pub max_pending_frames: usize,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_window_ms: 1200,
            audio_silence_ms: 800,
            min_speech_ms: 450,
            max_silent_interim_frames: 2,
            max_pending_frames: 500,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 8000,
            connect_timeout_ms: 5000,
        }
    }
}

impl SegmenterConfig {
    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    pub fn audio_silence(&self) -> Duration {
        Duration::from_millis(self.audio_silence_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Dialogue ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DialogueConfig {
    /// OpenAI-compatible API base (without `/chat/completions`).
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub system_prompt: String,
    /// Spoken as turn 0 as soon as the call starts.
    pub greeting: String,
    /// Spoken when a model or tool failure ends the turn.
    pub fallback_reply: String,
    /// Acknowledgement spoken while a tool without its own phrase runs.
    pub default_ack: String,
    /// Model → tool cycles allowed in one turn before giving up.
    pub max_tool_rounds: u32,
    /// IANA zone for the `current_datetime` note.
    pub timezone: String,
    /// Longest gap between streamed model deltas.
    pub idle_timeout_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o".into(),
            temperature: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            greeting: "Hi there! I'm Eva from Zuleikha Hospital. How can I help you today?"
                .into(),
            fallback_reply: "I'm sorry, I encountered an error while processing that. \
                             Could you please try again?"
                .into(),
            default_ack: "Let me process that for you.".into(),
            max_tool_rounds: 5,
            timezone: "Asia/Dubai".into(),
            idle_timeout_secs: 30,
        }
    }
}

impl DialogueConfig {
    pub fn timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| ConfigError::Invalid(format!("dialogue.timezone: {e}")))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

// ── Speech ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SpeechConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: String,
    /// Must match the telephony codec (8 kHz mu-law for media streams).
    pub output_format: String,
    pub stability: f32,
    pub similarity_boost: f32,
    /// Streamed chunks are coalesced until at least this many bytes before
    /// being sent as one marked segment. `0` marks every chunk.
    pub min_segment_bytes: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.elevenlabs.io".into(),
            api_key: None,
            voice_id: None,
            model_id: "eleven_turbo_v2_5".into(),
            output_format: "ulaw_8000".into(),
            stability: 0.75,
            similarity_boost: 1.0,
            min_segment_bytes: 0,
        }
    }
}

// ── Coordinator ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Longest wait for playback progress before the mute is force-released.
    pub playback_ack_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            playback_ack_timeout_ms: 8000,
        }
    }
}

impl CoordinatorConfig {
    pub fn playback_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_ack_timeout_ms)
    }
}

// ── Logging ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "callturn=info".into(),
            ansi: true,
        }
    }
}

// ── Tools ──────────────────────────────────────────────────────────

/// A tool implemented by an external HTTP endpoint.
///
/// Omitted description, schema and phrase are taken from the built-in clinic
/// manifest when `name` matches one of its tools.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HttpToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Phrase spoken while the tool runs.
    #[serde(default)]
    pub say: Option<String>,
    /// JSON Schema of the argument object.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.segmenter.silence_window_ms, 1200);
        assert_eq!(config.segmenter.min_speech_ms, 450);
        assert_eq!(config.segmenter.reconnect_max_attempts, 5);
        assert_eq!(config.coordinator.playback_ack_timeout_ms, 8000);
        assert_eq!(config.dialogue.max_tool_rounds, 5);
        assert!(config.tools.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [segmenter]
            silence_window_ms = 900

            [dialogue]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(config.segmenter.silence_window_ms, 900);
        assert_eq!(config.segmenter.audio_silence_ms, 800);
        assert_eq!(config.dialogue.model, "gpt-4o-mini");
        assert_eq!(config.dialogue.timezone, "Asia/Dubai");
    }

    #[test]
    fn tools_parse_with_optional_fields() {
        let config = Config::from_toml(
            r#"
            [[tools]]
            name = "saveUserRating"
            description = "Store the caller's ratings"
            say = "Thank you for your feedback!"
            endpoint = "http://localhost:9000/rating"
            "#,
        )
        .unwrap();
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].say.as_deref(), Some("Thank you for your feedback!"));
        assert!(config.tools[0].parameters.is_none());
    }

    #[test]
    fn validate_rejects_unknown_timezone() {
        let mut config = Config::default();
        config.dialogue.timezone = "Mars/Olympus".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_duplicate_tools() {
        let tool = HttpToolConfig {
            name: "bookMeeting".into(),
            description: "Book".into(),
            say: None,
            parameters: None,
            endpoint: "http://localhost/book".into(),
        };
        let config = Config {
            tools: vec![tool.clone(), tool],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tool name"));
    }

    #[test]
    fn validate_rejects_zero_pending_buffer() {
        let mut config = Config::default();
        config.segmenter.max_pending_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_fill_credentials() {
        let mut config = Config::default();
        config.apply_env_overrides_from(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "DEEPGRAM_API_KEY" => Some("dg-test".into()),
            "VOICE_ID" => Some("voice-1".into()),
            "XI_API_KEY" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.dialogue.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.transcription.api_key.as_deref(), Some("dg-test"));
        assert_eq!(config.speech.voice_id.as_deref(), Some("voice-1"));
        assert!(config.speech.api_key.is_none());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = Config::default();
        config.dialogue.api_key = Some("sk-secret".into());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn load_reads_file_and_records_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[coordinator]\nplayback_ack_timeout_ms = 3000").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.config_path, path);
        assert_eq!(config.coordinator.playback_ack_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[segmenter\nbroken").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn schema_describes_sections() {
        let schema = Config::json_schema();
        let rendered = schema.to_string();
        assert!(rendered.contains("segmenter"));
        assert!(rendered.contains("playback_ack_timeout_ms"));
    }
}
