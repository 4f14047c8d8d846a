use std::path::PathBuf;

/// Producer configuration.
///
/// `Default` reads the environment and falls back to local defaults:
///
/// | field        | variable           | fallback                  |
/// |--------------|--------------------|---------------------------|
/// | `executable` | `ELYTRON_KAFKACAT` | `kafkacat`                |
/// | `tmp_dir`    | `ELYTRON_TMP_DIR`  | [`std::env::temp_dir`]    |
/// | `prefix`     | `ELYTRON_PREFIX`   | `elytron`                 |
/// | `brokers`    | `KAFKA_BROKERS`    | `localhost:9092`          |
/// | `group`      | `ELYTRON_GROUP`    | `elytron`                 |
///
/// `brokers` is only the default: every publish may target other brokers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Path or name of the kafkacat executable.
    pub executable: String,
    /// Directory staging files are written to.
    pub tmp_dir: PathBuf,
    /// First component of staging file names.
    pub prefix: String,
    /// Comma separated broker list used when a publish names none.
    pub brokers: String,
    /// Consumer group used by group-based subscriptions.
    pub group: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            executable: env_or("ELYTRON_KAFKACAT", "kafkacat"),
            tmp_dir: std::env::var_os("ELYTRON_TMP_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            prefix: env_or("ELYTRON_PREFIX", "elytron"),
            brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
            group: env_or("ELYTRON_GROUP", "elytron"),
        }
    }
}

impl ProducerConfig {
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = brokers.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}
