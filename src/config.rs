//! Configuration for the pipeline and its engines.
//!
//! Settings come from an optional TOML file (`lumos.toml` in the output
//! root, or `--config`), and can then be overridden from the command line or
//! the environment. Everything has a sensible default, so the file is only
//! needed to tune things.
//!
//! ```toml
//! [pipeline]
//! concurrency = 2
//! failure_policy = "best_effort"
//! page_timeout_secs = 300
//! gaps = "placeholder"
//! page_headers = true
//!
//! [pipeline.retry]
//! max_retries = 2
//!
//! [engines]
//! translator = "lmstudio"
//! dpi = 300
//! rate_limit = "30/m"
//!
//! [engines.lmstudio]
//! url = "http://localhost:1234/v1"
//! model = "local-model"
//! ```

use std::time::Duration;

use clap::ValueEnum;
use schemars::JsonSchema;
use tokio::fs;
use toml_span::{DeserError, Value, de_helpers::TableHelper};

use crate::{
    aggregate::{AggregateFormat, GapPolicy},
    error::PipelineError,
    prelude::*,
    rate_limit::RateLimit,
    retry::RetryPolicy,
    toml_utils::{custom_deser_error, parse_toml_file},
};

/// The name of the per-root configuration file.
pub const CONFIG_FILE_NAME: &str = "lumos.toml";

/// What to do when a page fails.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching pages and mark the project `failed`.
    Strict,
    /// Record the failure and keep going.
    #[default]
    BestEffort,
}

/// Which translation backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TranslatorBackend {
    /// An OpenAI-compatible chat server, usually LM Studio.
    #[default]
    #[value(name = "lmstudio")]
    LmStudio,
    /// The `opencode` CLI.
    #[value(name = "opencode")]
    OpenCode,
}

/// Settings for running stages.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Pages processed at once. Must be at least 1.
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    /// Limit on each engine attempt for a page.
    pub page_timeout: Duration,
    pub retry: RetryPolicy,
    pub format: AggregateFormat,
    /// Events buffered per progress subscriber.
    pub progress_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            failure_policy: FailurePolicy::default(),
            page_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            format: AggregateFormat::default(),
            progress_buffer: 256,
        }
    }
}

impl PipelineConfig {
    /// Reject settings we can't run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::config("concurrency must be at least 1"));
        }
        if self.page_timeout.is_zero() {
            return Err(PipelineError::config("page timeout must be positive"));
        }
        if self.progress_buffer == 0 {
            return Err(PipelineError::config("progress buffer must be positive"));
        }
        if self.retry.min_backoff > self.retry.max_backoff {
            return Err(PipelineError::config(
                "minimum retry backoff exceeds maximum backoff",
            ));
        }
        Ok(())
    }
}

/// Settings for the external engines.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub translator: TranslatorBackend,

    /// Base URL of the OpenAI-compatible server.
    pub lmstudio_url: String,
    pub lmstudio_api_key: Option<String>,
    pub lmstudio_model: String,
    pub temperature: f32,

    /// Model for `opencode`, as `provider/model`.
    pub opencode_model: String,

    /// Resolution used when rasterizing PDF pages.
    pub dpi: u32,

    /// Limit on translation requests.
    pub rate_limit: Option<RateLimit>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            translator: TranslatorBackend::default(),
            lmstudio_url: "http://localhost:1234/v1".to_owned(),
            lmstudio_api_key: None,
            lmstudio_model: "local-model".to_owned(),
            temperature: 0.3,
            opencode_model: "github-copilot/gpt-5-mini".to_owned(),
            dpi: 300,
            rate_limit: None,
        }
    }
}

impl EngineConfig {
    /// Reject settings we can't run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.dpi == 0 {
            return Err(PipelineError::config("dpi must be positive"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::config("temperature must be between 0 and 2"));
        }
        Ok(())
    }
}

/// All our settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub engines: EngineConfig,
}

impl Config {
    /// Load configuration from `path`, or from `<root>/lumos.toml` if it
    /// exists, or use the defaults.
    #[instrument(level = "debug", skip_all)]
    pub async fn load(path: Option<&Path>, root: &Path) -> Result<Config> {
        let default_path = root.join(CONFIG_FILE_NAME);
        let path = match path {
            Some(path) => path.to_owned(),
            None if fs::try_exists(&default_path).await.unwrap_or(false) => default_path,
            None => {
                debug!("No configuration file; using defaults");
                return Ok(Config::default());
            }
        };
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = parse_toml_file::<Config>(&path, &text)?;
        debug!(path = %path.display(), ?config, "Loaded configuration");
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.pipeline.validate()?;
        self.engines.validate()
    }
}

impl<'de> toml_span::Deserialize<'de> for Config {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let pipeline = th.optional("pipeline").unwrap_or_default();
        let engines = th.optional("engines").unwrap_or_default();
        th.finalize(None)?;
        Ok(Config { pipeline, engines })
    }
}

impl<'de> toml_span::Deserialize<'de> for PipelineConfig {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let defaults = PipelineConfig::default();
        let mut th = TableHelper::new(value)?;
        let concurrency = th.optional::<u32>("concurrency");
        let failure_policy = th.optional_s::<String>("failure_policy");
        let page_timeout_secs = th.optional::<u64>("page_timeout_secs");
        let retry = th.optional::<RetryTable>("retry");
        let gaps = th.optional_s::<String>("gaps");
        let page_headers = th.optional::<bool>("page_headers");
        let progress_buffer = th.optional::<u32>("progress_buffer");
        th.finalize(None)?;

        let failure_policy = match failure_policy {
            Some(s) => parse_value_enum(s)?,
            None => defaults.failure_policy,
        };
        let gaps = match gaps {
            Some(s) => parse_value_enum::<GapPolicy>(s)?,
            None => defaults.format.gaps,
        };
        Ok(PipelineConfig {
            concurrency: concurrency.map_or(defaults.concurrency, |n| n as usize),
            failure_policy,
            page_timeout: page_timeout_secs
                .map_or(defaults.page_timeout, Duration::from_secs),
            retry: retry.map_or(defaults.retry, |t| t.0),
            format: AggregateFormat {
                gaps,
                page_headers: page_headers.unwrap_or(defaults.format.page_headers),
            },
            progress_buffer: progress_buffer
                .map_or(defaults.progress_buffer, |n| n as usize),
        })
    }
}

/// The `[pipeline.retry]` table.
struct RetryTable(RetryPolicy);

impl<'de> toml_span::Deserialize<'de> for RetryTable {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let defaults = RetryPolicy::default();
        let mut th = TableHelper::new(value)?;
        let max_retries = th.optional::<u32>("max_retries");
        let min_backoff_ms = th.optional::<u64>("min_backoff_ms");
        let max_backoff_ms = th.optional::<u64>("max_backoff_ms");
        th.finalize(None)?;
        Ok(RetryTable(RetryPolicy {
            max_retries: max_retries.unwrap_or(defaults.max_retries),
            min_backoff: min_backoff_ms.map_or(defaults.min_backoff, Duration::from_millis),
            max_backoff: max_backoff_ms.map_or(defaults.max_backoff, Duration::from_millis),
        }))
    }
}

impl<'de> toml_span::Deserialize<'de> for EngineConfig {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let defaults = EngineConfig::default();
        let mut th = TableHelper::new(value)?;
        let translator = th.optional_s::<String>("translator");
        let dpi = th.optional::<u32>("dpi");
        let rate_limit = th.optional::<RateLimit>("rate_limit");
        let lmstudio = th.optional::<LmStudioTable>("lmstudio");
        let opencode = th.optional::<OpenCodeTable>("opencode");
        th.finalize(None)?;

        let translator = match translator {
            Some(s) => parse_value_enum(s)?,
            None => defaults.translator,
        };
        let lmstudio = lmstudio.unwrap_or_default();
        Ok(EngineConfig {
            translator,
            lmstudio_url: lmstudio.url.unwrap_or(defaults.lmstudio_url),
            lmstudio_api_key: lmstudio.api_key,
            lmstudio_model: lmstudio.model.unwrap_or(defaults.lmstudio_model),
            temperature: lmstudio
                .temperature
                .map_or(defaults.temperature, |t| t as f32),
            opencode_model: opencode
                .and_then(|t| t.model)
                .unwrap_or(defaults.opencode_model),
            dpi: dpi.unwrap_or(defaults.dpi),
            rate_limit,
        })
    }
}

/// The `[engines.lmstudio]` table.
#[derive(Default)]
struct LmStudioTable {
    url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
}

impl<'de> toml_span::Deserialize<'de> for LmStudioTable {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let table = LmStudioTable {
            url: th.optional("url"),
            api_key: th.optional("api_key"),
            model: th.optional("model"),
            temperature: th.optional("temperature"),
        };
        th.finalize(None)?;
        Ok(table)
    }
}

/// The `[engines.opencode]` table.
struct OpenCodeTable {
    model: Option<String>,
}

impl<'de> toml_span::Deserialize<'de> for OpenCodeTable {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let model = th.optional("model");
        th.finalize(None)?;
        Ok(OpenCodeTable { model })
    }
}

/// Parse a string using a [`ValueEnum`]'s names, so that the config file and
/// the command line accept the same spellings. Underscores are accepted in
/// place of dashes.
fn parse_value_enum<T: ValueEnum>(
    s: toml_span::Spanned<String>,
) -> Result<T, DeserError> {
    T::from_str(&s.value.replace('_', "-"), true).map_err(|_| {
        let expected = T::value_variants()
            .iter()
            .filter_map(|v| v.to_possible_value())
            .map(|v| v.get_name().to_owned())
            .collect::<Vec<_>>();
        custom_deser_error(
            s.span,
            format!("unknown value {:?}, expected one of: {}", s.value, expected.join(", ")),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toml_utils::from_toml_str;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn parses_every_setting() {
        let config: Config = from_toml_str(
            r#"
            [pipeline]
            concurrency = 4
            failure_policy = "strict"
            page_timeout_secs = 30
            gaps = "omit"
            page_headers = false
            progress_buffer = 16

            [pipeline.retry]
            max_retries = 2
            min_backoff_ms = 100
            max_backoff_ms = 1000

            [engines]
            translator = "opencode"
            dpi = 200
            rate_limit = "30/m"

            [engines.lmstudio]
            url = "http://gpu-box:1234/v1"
            model = "qwen"
            temperature = 0.0

            [engines.opencode]
            model = "anthropic/claude-sonnet"
            "#,
        )
        .unwrap();
        let pipeline = &config.pipeline;
        assert_eq!(pipeline.concurrency, 4);
        assert_eq!(pipeline.failure_policy, FailurePolicy::Strict);
        assert_eq!(pipeline.page_timeout, Duration::from_secs(30));
        assert_eq!(pipeline.format.gaps, GapPolicy::Omit);
        assert!(!pipeline.format.page_headers);
        assert_eq!(pipeline.retry.max_retries, 2);
        assert_eq!(pipeline.retry.max_backoff, Duration::from_secs(1));
        let engines = &config.engines;
        assert_eq!(engines.translator, TranslatorBackend::OpenCode);
        assert_eq!(engines.dpi, 200);
        assert_eq!(engines.rate_limit.unwrap().to_string(), "30/m");
        assert_eq!(engines.lmstudio_url, "http://gpu-box:1234/v1");
        assert_eq!(engines.lmstudio_model, "qwen");
        assert_eq!(engines.temperature, 0.0);
        assert_eq!(engines.opencode_model, "anthropic/claude-sonnet");
    }

    #[test]
    fn rejects_unknown_keys_and_values() {
        assert!(from_toml_str::<Config>("[pipeline]\nconcurency = 2\n").is_err());
        assert!(from_toml_str::<Config>("[pipeline]\nfailure_policy = \"lax\"\n").is_err());
        assert!(from_toml_str::<Config>("[engines]\nrate_limit = \"fast\"\n").is_err());
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.pipeline.concurrency = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn load_falls_back_to_defaults() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        assert_eq!(Config::load(None, root.path()).await?, Config::default());

        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "[pipeline]\nconcurrency = 3\n",
        )?;
        assert_eq!(Config::load(None, root.path()).await?.pipeline.concurrency, 3);
        Ok(())
    }
}
