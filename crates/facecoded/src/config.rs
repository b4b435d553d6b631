use facecode_core::{ConfigError, PipelineConfig};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:8081";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8081).
    pub bind: String,
    /// Optional pipeline TOML file.
    pub pipeline_config: Option<PathBuf>,
    /// Overrides the pipeline's model directory.
    pub model_dir: Option<PathBuf>,
    /// Extractions allowed to run at once.
    pub max_concurrent: usize,
    /// Deadline for one request, queueing included.
    pub request_timeout_secs: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `FACECODE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            bind: lookup("FACECODE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            pipeline_config: lookup("FACECODE_CONFIG").map(PathBuf::from),
            model_dir: lookup("FACECODE_MODEL_DIR").map(PathBuf::from),
            max_concurrent: parse_or(&lookup, "FACECODE_MAX_CONCURRENT", default_concurrency).max(1),
            request_timeout_secs: parse_or(
                &lookup,
                "FACECODE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            max_body_bytes: parse_or(&lookup, "FACECODE_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Pipeline configuration from the TOML file (or defaults), with the model
    /// directory override applied.
    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let mut pipeline = match &self.pipeline_config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(dir) = &self.model_dir {
            pipeline.model_dir = dir.clone();
        }
        Ok(pipeline)
    }
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.bind, "0.0.0.0:8081");
        assert_eq!(c.request_timeout(), Duration::from_secs(30));
        assert_eq!(c.max_body_bytes, 20 * 1024 * 1024);
        assert!(c.max_concurrent >= 1);
        assert!(c.pipeline_config.is_none());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let c = config(&[
            ("FACECODE_BIND", "127.0.0.1:9000"),
            ("FACECODE_MAX_CONCURRENT", "0"),
            ("FACECODE_REQUEST_TIMEOUT_SECS", "soon"),
            ("FACECODE_MODEL_DIR", "/srv/models"),
        ]);
        assert_eq!(c.bind, "127.0.0.1:9000");
        assert_eq!(c.max_concurrent, 1);
        assert_eq!(c.request_timeout_secs, 30);
        assert_eq!(c.pipeline().unwrap().model_dir, PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_pipeline_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[encoder]\nkind = \"hog\"\n").unwrap();
        let c = config(&[("FACECODE_CONFIG", file.path().to_str().unwrap())]);
        assert_eq!(c.pipeline().unwrap().encoder.kind, facecode_core::config::EncoderKind::Hog);

        let missing = config(&[("FACECODE_CONFIG", "/nonexistent/facecode.toml")]);
        assert!(missing.pipeline().is_err());
    }
}
