use serde::Deserialize;
use std::env;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::models::ViolationKind;
use crate::utils::retry::BackoffStrategy;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub api: ApiSettings,
    #[validate(nested)]
    pub storage: StorageSettings,
    #[validate(nested)]
    pub sync: SyncSettings,
    #[validate(nested)]
    pub integrity: IntegritySettings,
    #[validate(nested)]
    pub timer: TimerSettings,
    #[validate(nested)]
    pub batch: BatchSettings,
    #[validate(nested)]
    pub completion: CompletionSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ApiSettings {
    #[validate(url(message = "api.base_url must be an absolute URL"))]
    pub base_url: String,
    /// Applies to every remote call; elapsed counts as a network failure.
    #[validate(range(min = 100, max = 120000))]
    pub request_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    #[validate(length(min = 1))]
    pub path: String,
    pub redis_uri: Option<String>,
    /// Records older than this are not restored on load.
    #[validate(range(min = 1, max = 720))]
    pub freshness_hours: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: ".proctor-drafts".to_string(),
            redis_uri: None,
            freshness_hours: 24,
        }
    }
}

impl StorageSettings {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct SyncSettings {
    #[validate(range(min = 1, max = 600))]
    pub debounce_secs: u64,
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: usize,
    #[validate(range(min = 10, max = 60000))]
    pub base_backoff_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_secs: 30,
            max_attempts: 3,
            base_backoff_ms: 1000,
            backoff: BackoffStrategy::Linear,
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

/// Per-kind weight added to the weighted score.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ViolationWeights {
    #[validate(range(min = 0.0))]
    pub tab_switch: f64,
    #[validate(range(min = 0.0))]
    pub focus_loss: f64,
    #[validate(range(min = 0.0))]
    pub copy_attempt: f64,
    #[validate(range(min = 0.0))]
    pub paste_attempt: f64,
    #[validate(range(min = 0.0))]
    pub right_click: f64,
    #[validate(range(min = 0.0))]
    pub dev_tools_open: f64,
}

impl Default for ViolationWeights {
    fn default() -> Self {
        Self {
            tab_switch: 1.0,
            focus_loss: 1.0,
            copy_attempt: 1.0,
            paste_attempt: 2.0,
            right_click: 0.5,
            dev_tools_open: 3.0,
        }
    }
}

impl ViolationWeights {
    pub fn uniform(weight: f64) -> Self {
        Self {
            tab_switch: weight,
            focus_loss: weight,
            copy_attempt: weight,
            paste_attempt: weight,
            right_click: weight,
            dev_tools_open: weight,
        }
    }

    pub fn weight(&self, kind: ViolationKind) -> f64 {
        match kind {
            ViolationKind::TabSwitch => self.tab_switch,
            ViolationKind::FocusLoss => self.focus_loss,
            ViolationKind::CopyAttempt => self.copy_attempt,
            ViolationKind::PasteAttempt => self.paste_attempt,
            ViolationKind::RightClick => self.right_click,
            ViolationKind::DevToolsOpen => self.dev_tools_open,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_warning_ladder"))]
pub struct IntegritySettings {
    #[validate(nested)]
    pub weights: ViolationWeights,
    /// Ascending score thresholds; the last one disqualifies.
    pub warning_thresholds: Vec<f64>,
    #[validate(range(min = 1, max = 50))]
    pub max_warnings: u32,
    /// Outer/inner window delta that suggests a docked devtools panel.
    #[validate(range(min = 1))]
    pub viewport_delta_px: u32,
    #[validate(range(min = 100))]
    pub viewport_sample_ms: u64,
    pub viewport_suppress_ms: u64,
}

impl Default for IntegritySettings {
    fn default() -> Self {
        Self {
            weights: ViolationWeights::default(),
            warning_thresholds: vec![3.0, 6.0, 10.0],
            max_warnings: 3,
            viewport_delta_px: 160,
            viewport_sample_ms: 2000,
            viewport_suppress_ms: 5000,
        }
    }
}

impl IntegritySettings {
    pub fn viewport_sample_interval(&self) -> Duration {
        Duration::from_millis(self.viewport_sample_ms)
    }

    pub fn viewport_suppression(&self) -> Duration {
        Duration::from_millis(self.viewport_suppress_ms)
    }
}

fn validate_warning_ladder(settings: &IntegritySettings) -> Result<(), ValidationError> {
    if settings.warning_thresholds.len() != settings.max_warnings as usize {
        let mut err = ValidationError::new("warning_thresholds_len");
        err.message = Some("warning_thresholds must have exactly max_warnings entries".into());
        return Err(err);
    }
    let ascending = settings
        .warning_thresholds
        .windows(2)
        .all(|pair| pair[0] < pair[1]);
    let positive = settings.warning_thresholds.iter().all(|t| *t > 0.0);
    if !ascending || !positive {
        let mut err = ValidationError::new("warning_thresholds_order");
        err.message = Some("warning_thresholds must be positive and strictly ascending".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct TimerSettings {
    #[validate(range(min = 10, max = 60000))]
    pub tick_ms: u64,
    /// Full session refresh cadence. Zero disables periodic refresh.
    pub refresh_interval_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            refresh_interval_secs: 60,
        }
    }
}

impl TimerSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BatchSettings {
    #[validate(range(min = 1, max = 100))]
    pub chunk_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { chunk_size: 5 }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct CompletionSettings {
    /// Upper bound on the pre-completion draft flush.
    #[validate(range(min = 100, max = 60000))]
    pub flush_timeout_ms: u64,
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: usize,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 3000,
            max_attempts: 3,
        }
    }
}

impl CompletionSettings {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Local .env first, then the repository root one
        if dotenvy::dotenv().is_err() {
            dotenvy::from_path("../../.env").ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides (APP__SYNC__DEBOUNCE_SECS=10)
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config
            .validate()
            .map_err(|e| config::ConfigError::Message(format!("Invalid configuration: {}", e)))?;

        tracing::debug!(
            "Configuration loaded: env={}, api={}, storage={:?}",
            env,
            config.api.base_url,
            config.storage.backend
        );

        Ok(config)
    }
}
