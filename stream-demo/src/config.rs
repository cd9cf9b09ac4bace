use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use stream_client::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "EVENT_HUB_FULLY_QUALIFIED_NAMESPACE", default = "demo.servicebus.local")]
    pub namespace: String,

    #[envconfig(from = "EVENT_HUB_NAME", default = "demo-events")]
    pub stream_name: String,

    #[envconfig(from = "CONSUMER_GROUP", default = "$Default")]
    pub consumer_group: String,

    /// Secret the in-process stream accepts tokens for.
    #[envconfig(from = "STREAM_ACCESS_KEY", default = "demo-access-key")]
    pub access_key: String,

    #[envconfig(from = "STREAM_PARTITION_COUNT", default = "4")]
    pub partition_count: u32,

    #[envconfig(from = "SCHEMA_REGISTRY_ENDPOINT", default = "schemas.servicebus.local")]
    pub schema_registry_endpoint: String,

    #[envconfig(from = "SCHEMA_GROUP", default = "demo-schemas")]
    pub schema_group: String,

    #[envconfig(from = "STORAGE_ACCOUNT_NAME", default = "demostorage")]
    pub storage_account_name: String,

    #[envconfig(from = "BLOB_CONTAINER_NAME", default = "checkpoints")]
    pub blob_container_name: String,

    /// Local directory standing in for the checkpoint storage account.
    #[envconfig(from = "CHECKPOINT_DIR", default = ".checkpoints")]
    pub checkpoint_dir: PathBuf,

    #[envconfig(default = "30000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub send_timeout: EnvMsDuration,

    #[envconfig(default = "1048576")]
    pub max_batch_size_bytes: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "false")]
    pub metrics_enabled: bool,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9102")]
    pub port: u16,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Where checkpoints of this storage account and container are kept.
    pub fn checkpoint_root(&self) -> PathBuf {
        self.checkpoint_dir
            .join(&self.storage_account_name)
            .join(&self.blob_container_name)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .maximum_interval(self.retry_policy.maximum_interval.0)
        .max_attempts(self.retry_policy.max_attempts)
        .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "800")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "4")]
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_without_environment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.consumer_group, "$Default");
        assert_eq!(config.blob_container_name, "checkpoints");
        assert!(!config.metrics_enabled);
        assert_eq!(config.retry_policy().max_attempts, 4);
        assert_eq!(
            config.checkpoint_root(),
            PathBuf::from(".checkpoints/demostorage/checkpoints")
        );
    }

    #[test]
    fn reads_stream_settings() {
        let env = HashMap::from([
            ("EVENT_HUB_NAME".to_string(), "orders".to_string()),
            ("CONSUMER_GROUP".to_string(), "billing".to_string()),
            ("CONNECT_TIMEOUT".to_string(), "250".to_string()),
            ("INITIAL_INTERVAL".to_string(), "10".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.stream_name, "orders");
        assert_eq!(config.consumer_group, "billing");
        assert_eq!(config.connect_timeout.0, time::Duration::from_millis(250));
        assert_eq!(
            config.retry_policy().initial_interval,
            time::Duration::from_millis(10)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
