use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::format::SerializationConfig;

pub const DEFAULT_CODE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

pub const ENV_MODE: &str = "OC_OBJCACHE_MODE";
pub const ENV_DIR: &str = "OC_OBJCACHE_DIR";
pub const ENV_CODE_BUFFER_SIZE: &str = "OC_CODE_BUFFER_SIZE";
pub const ENV_PERF_MAP: &str = "OC_PERF_MAP";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjCacheMode {
    #[default]
    Off,
    Read,
    #[serde(alias = "readwrite")]
    ReadWrite,
}

impl ObjCacheMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "" => Some(ObjCacheMode::Off),
            "read" | "ro" => Some(ObjCacheMode::Read),
            "readwrite" | "read_write" | "rw" | "1" => Some(ObjCacheMode::ReadWrite),
            _ => None,
        }
    }

    pub fn loads(self) -> bool {
        !matches!(self, ObjCacheMode::Off)
    }

    pub fn stores(self) -> bool {
        matches!(self, ObjCacheMode::ReadWrite)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Json { path: PathBuf, source: serde_json::Error },
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Json { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: ObjCacheMode,
    pub cache_dir: Option<PathBuf>,
    pub code_buffer_size: usize,
    pub perf_map: bool,
    pub serialization: SerializationConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: ObjCacheMode::Off,
            cache_dir: None,
            code_buffer_size: DEFAULT_CODE_BUFFER_SIZE,
            perf_map: false,
            serialization: SerializationConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validated()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_MODE) {
            config.mode = ObjCacheMode::parse(&value).ok_or(ConfigError::InvalidValue {
                key: ENV_MODE,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_DIR) {
            let trimmed = value.trim();
            config.cache_dir = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
        }
        if let Some(value) = lookup(ENV_CODE_BUFFER_SIZE) {
            config.code_buffer_size =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_CODE_BUFFER_SIZE,
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup(ENV_PERF_MAP) {
            config.perf_map = parse_bool(&value).ok_or(ConfigError::InvalidValue {
                key: ENV_PERF_MAP,
                value,
            })?;
        }
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.code_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_CODE_BUFFER_SIZE,
                value: "0".to_string(),
            });
        }
        Ok(self)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
