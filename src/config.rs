//! Configuration for the server

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::{
    cache::DEFAULT_TARGET_FREE_RATIO,
    monitor::DEFAULT_CHECK_INTERVAL,
    recovery::RECOVERY_FILE_NAME,
    repeat_guard::{DEFAULT_MAX_TRACKED, DEFAULT_WINDOW},
};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9118);

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CDB_DAL_DATA_DIR";

/// Name of the node tree directory inside the database root.
pub const CDB_DIR: &str = "CDB";

/// Failure to load the configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database root. The node tree is read from its `CDB` subdirectory.
    pub root: PathBuf,
    /// Config for listener recovery.
    pub recovery: RecoveryConfig,
    /// Config for the document cache.
    pub cache: CacheConfig,
    /// Config for throttling of repeated lookup failures.
    pub repeat_guard: RepeatGuardConfig,
    /// Config for the HTTP server
    ///
    /// If set to `None` no HTTP server will be started.
    pub http: Option<HttpConfig>,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// The config for listener recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Keep the recovery file up to date.
    pub enabled: bool,
    /// Restore the listeners of the recovery file on startup.
    pub replay: bool,
    /// Location of the recovery file. Defaults to `CDB_Recovery.txt` in the data directory.
    pub file: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replay: true,
            file: None,
        }
    }
}

/// The config for the document cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Share of memory that should stay free.
    pub target_free_ratio: f64,
    /// Pause between two memory checks.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Memory limit for this process in bytes. Without it, system memory is the limit.
    pub memory_limit: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            target_free_ratio: DEFAULT_TARGET_FREE_RATIO,
            check_interval: DEFAULT_CHECK_INTERVAL,
            memory_limit: None,
        }
    }
}

/// The config for throttling repeated lookup failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatGuardConfig {
    /// Window in which repeated failures are only counted.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Number of distinct curls tracked at once.
    pub max_tracked: usize,
}

impl Default for RepeatGuardConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_tracked: DEFAULT_MAX_TRACKED,
        }
    }
}

/// The config for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to bind to.
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset).
    pub bind_addr: Option<IpAddr>,
}

/// The config for the metrics server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu { path })?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        let dir = if let Some(val) = env::var_os(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
            path.join("cdb-dal")
        };
        Ok(dir)
    }

    /// Directory of the node tree.
    pub fn cdb_root(&self) -> PathBuf {
        self.root.join(CDB_DIR)
    }

    /// Get the path to the recovery file, or `None` if recovery is disabled.
    pub fn recovery_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        if !self.recovery.enabled {
            return Ok(None);
        }
        match &self.recovery.file {
            Some(file) => Ok(Some(file.clone())),
            None => Ok(Some(Self::data_dir()?.join(RECOVERY_FILE_NAME))),
        }
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            recovery: RecoveryConfig::default(),
            cache: CacheConfig::default(),
            repeat_guard: RepeatGuardConfig::default(),
            http: Some(HttpConfig {
                port: 8080,
                bind_addr: None,
            }),
            metrics: None,
        }
    }
}
