//! The single immutable configuration record every component reads.
//!
//! Parsed once at startup from a TOML file named by `CYRUS_CONFIG`,
//! alongside the `CYRUS_USER` runtime-uid check and the "never run as
//! root" startup guard. Components that allow a subset of settings to
//! change at runtime (the mailbox-to-backend map, user ACLs) re-read
//! their own on-disk state on `SIGUSR1`; this record itself is not
//! mutated in place, a reload replaces it wholesale.

use std::io::Read as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use silo_mboxname::{HierSep, Namespace};
use thiserror::Error;
use tracing::info;

pub const ENV_USER: &str = "CYRUS_USER";
pub const ENV_CONFIG: &str = "CYRUS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("environment variable {0} must be set")]
    MissingEnv(&'static str),
    #[error("refusing to start as root (uid 0); run under the unprivileged {ENV_USER}")]
    RunningAsRoot,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level config record. One instance per process, built once at
/// startup and handed out behind an `Arc` by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub spool: SpoolConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    pub lmtp: LmtpConfig,
    pub imap: ImapConfig,
    pub discovery: Option<DiscoveryConfig>,
    pub proxy: Option<ProxyConfig>,
}

/// Spool layout, per §6: `/<root>/<bucket>/<mailbox>/…`, `/<root>/db/`,
/// `/<root>/quota/<bucket>/<root>`, `/<root>/user/<bucket>/<user>.{seen,sub}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    pub root: PathBuf,
    /// Tag used when single-instance-staging a delivered message
    /// (§4.E: one message file per hostname, linked into every
    /// target mailbox).
    pub hostname: String,
}

impl SpoolConfig {
    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn quota_dir(&self) -> PathBuf {
        self.root.join("quota")
    }

    pub fn user_dir(&self) -> PathBuf {
        self.root.join("user")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HierarchySeparator {
    Dot,
    Slash,
}

impl Default for HierarchySeparator {
    fn default() -> Self {
        HierarchySeparator::Dot
    }
}

impl From<HierarchySeparator> for HierSep {
    fn from(value: HierarchySeparator) -> Self {
        match value {
            HierarchySeparator::Dot => HierSep::Dot,
            HierarchySeparator::Slash => HierSep::Slash,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub separator: HierarchySeparator,
}

impl NamespaceConfig {
    pub fn namespace(&self) -> Namespace {
        Namespace {
            external_sep: self.separator.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Default quota limit in bytes applied to a quota root with no
    /// explicit limit recorded in its quota file; `None` means
    /// unlimited.
    #[serde(default)]
    pub default_limit_bytes: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig {
            default_limit_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LmtpConfig {
    pub bind_addr: SocketAddr,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    pub bind_addr: SocketAddr,
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_discovery_timeout_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub mupdate_server: SocketAddr,
    #[serde(default = "default_idle_reap_secs")]
    pub idle_reap_secs: u64,
}

fn default_idle_reap_secs() -> u64 {
    300
}

/// Parses and validates a config file. Does not perform the
/// environment/root checks; call [`check_environment`] separately so
/// callers that only want to validate a config file (tests, a `-n`
/// dry-run flag) aren't forced through the startup guard.
pub fn read_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads the config file named by `CYRUS_CONFIG` and enforces the
/// `CYRUS_USER`/non-root startup invariants from §6.
pub fn load_from_environment() -> Result<Config> {
    check_environment()?;
    let path = std::env::var(ENV_CONFIG).map_err(|_| ConfigError::MissingEnv(ENV_CONFIG))?;
    let config = read_config(&path)?;
    info!(%path, "loaded configuration");
    Ok(config)
}

/// Validates that `CYRUS_USER` is set and the process is not running
/// as root. Split out from [`load_from_environment`] so a caller that
/// already has a config file in hand can still run the same guard.
pub fn check_environment() -> Result<()> {
    if std::env::var(ENV_USER).is_err() {
        return Err(ConfigError::MissingEnv(ENV_USER));
    }
    if running_as_root() {
        return Err(ConfigError::RunningAsRoot);
    }
    Ok(())
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
