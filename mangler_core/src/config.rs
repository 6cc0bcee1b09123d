use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10001
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_dbq_max() -> usize {
    50
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("mangler_work")
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_fuzzbot_options() -> toml::Value {
    toml::Value::Table(Default::default())
}

/// Broker options, merged over these defaults from a TOML file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub debug: bool,
    /// Accept and discard results without a store; smoke-test mode.
    #[serde(default)]
    pub dummy: bool,
    /// Start in the shedding state (tests and drills).
    #[serde(default)]
    pub queue_shedding: bool,
    /// Result-store backlog size that triggers shedding.
    #[serde(default = "default_dbq_max")]
    pub dbq_max: usize,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Create the work directory without prompting the operator.
    #[serde(default)]
    pub assume_yes: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            listen_ip: default_listen_ip(),
            listen_port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            debug: false,
            dummy: false,
            queue_shedding: false,
            dbq_max: default_dbq_max(),
            work_dir: default_work_dir(),
            assume_yes: false,
        }
    }
}

/// Producer options.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Name of the production generator the CLI should wire up.
    pub production_generator: Option<String>,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub debug: bool,
    /// Free text prepended to every test tag.
    #[serde(default)]
    pub base_tag: String,
    /// Opaque options forwarded to workers with every test.
    #[serde(default = "default_fuzzbot_options")]
    pub fuzzbot_options: toml::Value,
    #[serde(default)]
    pub assume_yes: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            server_ip: default_server_ip(),
            server_port: default_port(),
            work_dir: default_work_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            production_generator: None,
            queue_name: default_queue_name(),
            debug: false,
            base_tag: String::new(),
            fuzzbot_options: toml::Value::Table(Default::default()),
            assume_yes: false,
        }
    }
}

/// Worker options.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub assume_yes: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            server_ip: default_server_ip(),
            server_port: default_port(),
            work_dir: default_work_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_name: default_queue_name(),
            assume_yes: false,
        }
    }
}

/// Loads a component configuration from a TOML file.
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
    toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e))
}

/// Ensures the component's work directory exists.
///
/// A missing directory is created after confirming with the operator on
/// stdin, unless `assume_yes` suppresses the prompt. Declining is an error;
/// callers exit non-zero.
pub fn ensure_work_dir(path: &Path, assume_yes: bool) -> Result<(), anyhow::Error> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("work dir {:?} exists but is not a directory", path);
        }
        return Ok(());
    }
    if !assume_yes {
        print!("Work directory {path:?} does not exist. Create it? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            anyhow::bail!("operator declined to create work dir {:?}", path);
        }
    }
    std::fs::create_dir_all(path)
        .map_err(|e| anyhow::anyhow!("Failed to create work dir {:?}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn broker_config_parses_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(&path, "listen-port = 12000\ndbq-max = 5\n").unwrap();
        let config: BrokerConfig = load_config(&path).unwrap();
        assert_eq!(config.listen_port, 12000);
        assert_eq!(config.dbq_max, 5);
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.poll_interval_ms, 1000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(&path, "listen-prot = 12000\n").unwrap();
        assert!(load_config::<BrokerConfig>(&path).is_err());
    }

    #[test]
    fn producer_config_carries_tag_and_options() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("producer.toml");
        std::fs::write(
            &path,
            "queue-name = \"tcp\"\nbase-tag = \"campaign-7\"\n[fuzzbot-options]\ntimeout = 5\n",
        )
        .unwrap();
        let config: ProducerConfig = load_config(&path).unwrap();
        assert_eq!(config.queue_name, "tcp");
        assert_eq!(config.base_tag, "campaign-7");
        assert_eq!(config.fuzzbot_options["timeout"].as_integer(), Some(5));
    }

    #[test]
    fn ensure_work_dir_accepts_existing_directories() {
        let dir = tempdir().unwrap();
        ensure_work_dir(dir.path(), false).unwrap();

        let missing = dir.path().join("fresh");
        ensure_work_dir(&missing, true).unwrap();
        assert!(missing.is_dir());

        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_work_dir(&file, true).is_err());
    }
}
