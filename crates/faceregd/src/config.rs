use facereg_core::{
    BoxedStorage, FileStorage, MatchStrategy, MemoryStorage, RegistryConfig, SqliteStorage,
    StorageError, DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD, DEFAULT_STORAGE_KEY,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Where the descriptor store is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// `<data_dir>/<key>.json`
    File,
    /// `<data_dir>/faces.db`
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend {other:?}")),
        }
    }
}

/// Which D-Bus bus the service is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `FACEREG_CONFIG` (if
/// any), then `FACEREG_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageBackend,
    /// Directory holding the persisted store.
    pub data_dir: PathBuf,
    /// Key the store is saved under.
    pub storage_key: String,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Canonical descriptor length.
    pub descriptor_dim: usize,
    pub match_strategy: MatchStrategy,
    pub bus: BusKind,
    /// Period of the recognition loop.
    pub frame_interval_ms: u64,
    /// Read detection frames as JSON lines from stdin.
    pub feed_stdin: bool,
}

/// On-disk form of [`Config`]; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    storage: Option<StorageBackend>,
    data_dir: Option<PathBuf>,
    storage_key: Option<String>,
    match_threshold: Option<f32>,
    descriptor_dim: Option<usize>,
    match_strategy: Option<MatchStrategy>,
    bus: Option<BusKind>,
    frame_interval_ms: Option<u64>,
    feed_stdin: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageBackend::File,
            data_dir: default_data_dir(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            match_strategy: MatchStrategy::Nearest,
            bus: BusKind::Session,
            frame_interval_ms: 100,
            feed_stdin: false,
        }
    }
}

impl Config {
    /// Load configuration from the optional config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEREG_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Check the values a registry cannot work with: a NaN, infinite or
    /// negative match threshold, a zero descriptor length, an empty key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge(file);
        self.validate()?;
        tracing::debug!(path = %path.display(), "config file applied");
        Ok(())
    }

    fn merge(&mut self, file: FileConfig) {
        let FileConfig {
            storage,
            data_dir,
            storage_key,
            match_threshold,
            descriptor_dim,
            match_strategy,
            bus,
            frame_interval_ms,
            feed_stdin,
        } = file;

        if let Some(v) = storage {
            self.storage = v;
        }
        if let Some(v) = data_dir {
            self.data_dir = v;
        }
        if let Some(v) = storage_key {
            self.storage_key = v;
        }
        if let Some(v) = match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = descriptor_dim {
            self.descriptor_dim = v;
        }
        if let Some(v) = match_strategy {
            self.match_strategy = v;
        }
        if let Some(v) = bus {
            self.bus = v;
        }
        if let Some(v) = frame_interval_ms {
            self.frame_interval_ms = v;
        }
        if let Some(v) = feed_stdin {
            self.feed_stdin = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEREG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("FACEREG_STORAGE_KEY") {
            self.storage_key = key;
        }
        self.storage = env_parse(&lookup, "FACEREG_STORAGE", self.storage);
        self.match_threshold = env_parse(&lookup, "FACEREG_MATCH_THRESHOLD", self.match_threshold);
        self.descriptor_dim = env_parse(&lookup, "FACEREG_DESCRIPTOR_DIM", self.descriptor_dim);
        self.match_strategy = env_parse(&lookup, "FACEREG_MATCH_STRATEGY", self.match_strategy);
        self.bus = env_parse(&lookup, "FACEREG_BUS", self.bus);
        self.frame_interval_ms =
            env_parse(&lookup, "FACEREG_FRAME_INTERVAL_MS", self.frame_interval_ms);
        if let Some(v) = lookup("FACEREG_FEED_STDIN") {
            self.feed_stdin = v != "0";
        }
    }

    /// Registry parameters derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            storage_key: self.storage_key.clone(),
            threshold: self.match_threshold,
            descriptor_dim: self.descriptor_dim,
            strategy: self.match_strategy,
        }
    }

    /// Open the configured storage backend.
    pub fn open_storage(&self) -> Result<BoxedStorage, StorageError> {
        let storage: BoxedStorage = match self.storage {
            StorageBackend::File => Box::new(FileStorage::open(&self.data_dir)?),
            StorageBackend::Sqlite => Box::new(SqliteStorage::open(self.data_dir.join("faces.db"))?),
            StorageBackend::Memory => Box::new(MemoryStorage::new()),
        };
        Ok(storage)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg")
}

/// Parse `key` if set, keeping `current` when unset or unparsable.
fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return current;
    };
    match raw.parse() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid setting");
            current
        }
    }
}
