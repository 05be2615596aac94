use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::bert_engine::BertConfig;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "5000")]
    pub port: u16,

    /// Local path to the pretrained model directory
    #[arg(long, env = "MODEL_PATH", default_value = "./model_save")]
    pub model_path: PathBuf,

    /// Model ID on the Hugging Face Hub, used when MODEL_PATH does not exist
    #[arg(long, env = "MODEL_ID")]
    pub model_id: Option<String>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Use PyTorch weights instead of safetensors
    #[arg(long, env = "USE_PTH")]
    pub use_pth: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Fixed token window; longer input is truncated, shorter input padded
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "128")]
    pub max_sequence_length: usize,

    /// Directory for transient uploaded files
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Maximum accepted request body size for uploads, in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "16777216")]
    pub max_upload_bytes: usize,

    /// Maximum number of texts per forward pass
    #[arg(long, env = "BATCH_SIZE", default_value = "8")]
    pub batch_size: usize,

    /// Tick duration in milliseconds before a partial batch is run
    #[arg(long, env = "TICK_DURATION_MS", default_value = "10")]
    pub tick_duration_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub tick_duration: Duration,
}

impl From<&Config> for BatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            tick_duration: Duration::from_millis(config.tick_duration_ms.max(1)),
        }
    }
}

impl From<&Config> for BertConfig {
    fn from(config: &Config) -> Self {
        // A missing local directory falls through to the Hub when an id is given.
        let model_path = if config.model_id.is_some() && !config.model_path.exists() {
            None
        } else {
            Some(config.model_path.clone())
        };

        Self {
            model_id: config.model_id.clone(),
            model_path,
            revision: config.model_revision.clone(),
            use_pth: config.use_pth,
            cpu: config.cpu_only,
            max_sequence_length: config.max_sequence_length,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = Config::try_parse_from(["hatescan"]).unwrap();
        assert_eq!(config.max_sequence_length, 128);
        assert_eq!(config.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.model_path, PathBuf::from("./model_save"));
    }

    #[test]
    fn server_address_joins_host_and_port() {
        let config =
            Config::try_parse_from(["hatescan", "--host", "127.0.0.1", "--port", "8080"]).unwrap();
        assert_eq!(config.server_address(), "127.0.0.1:8080");
    }

    #[test]
    fn batch_config_never_zero() {
        let config =
            Config::try_parse_from(["hatescan", "--batch-size", "0", "--tick-duration-ms", "0"])
                .unwrap();
        let batch = BatchConfig::from(&config);
        assert_eq!(batch.batch_size, 1);
        assert_eq!(batch.tick_duration, Duration::from_millis(1));
    }

    #[test]
    fn hub_is_used_only_when_local_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().to_str().unwrap();

        let config =
            Config::try_parse_from(["hatescan", "--model-path", local, "--model-id", "org/m"])
                .unwrap();
        assert_eq!(BertConfig::from(&config).model_path, Some(dir.path().to_path_buf()));

        let missing = dir.path().join("nope");
        let config = Config::try_parse_from([
            "hatescan",
            "--model-path",
            missing.to_str().unwrap(),
            "--model-id",
            "org/m",
        ])
        .unwrap();
        assert_eq!(BertConfig::from(&config).model_path, None);
    }
}
