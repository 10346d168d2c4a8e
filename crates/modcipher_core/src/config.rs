use anyhow::{Context, Result};
use clap::Parser;
use modcipher_net::{NativeProvider, RootSource};
use crate::proxy::ProxyConfig;
use modcipher_traits::{CipherSuite, PreferenceEntry, Preferences};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fetch URLs over connections whose TLS ClientHello offers cipher suites
/// in a chosen order.
#[derive(Parser, Debug, Clone)]
#[command(name = "modcipher", version)]
pub struct Args {
    /// Raise a cipher suite: hexadecimal id with an optional score (default 1).
    /// Higher scores are offered first. Repeatable.
    #[arg(long = "prefer", value_name = "HEX[=SCORE]")]
    pub prefer: Vec<PreferenceEntry>,

    /// TOML configuration file
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// TCP connect timeout in seconds
    #[arg(long = "connect-timeout", value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// TLS handshake timeout in seconds
    #[arg(long = "tls-timeout", value_name = "SECONDS")]
    pub tls_timeout: Option<u64>,

    /// Trust the operating system's certificate store instead of the bundled roots
    #[arg(long = "native-roots")]
    pub native_roots: bool,

    /// URLs to fetch, in order
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Hexadecimal cipher suite id -> score
    pub preferences: BTreeMap<CipherSuite, i64>,
    pub connect_timeout_secs: Option<u64>,
    pub tls_handshake_timeout_secs: Option<u64>,
    pub native_roots: bool,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn preference_entries(&self) -> impl Iterator<Item = PreferenceEntry> + '_ {
        self.preferences
            .iter()
            .map(|(&suite, &score)| PreferenceEntry { suite, score })
    }
}

/// Settings for one run, after merging the config file with the flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub preferences: Preferences,
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub roots: RootSource,
    pub proxy: ProxyConfig,
    pub urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferences: Preferences::default(),
            connect_timeout: modcipher_net::Dialer::DEFAULT_CONNECT_TIMEOUT,
            tls_handshake_timeout: NativeProvider::DEFAULT_HANDSHAKE_TIMEOUT,
            roots: RootSource::default(),
            proxy: ProxyConfig::default(),
            urls: Vec::new(),
        }
    }
}

impl Config {
    /// Reads the file named by `--config`, if any, applies the flags on top
    /// and picks up proxies from the environment.
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        let mut config = Self::merge(file, args);
        config.proxy = ProxyConfig::from_env()?;
        Ok(config)
    }

    /// Flags win over the file; `--prefer` entries are applied after the
    /// file's preferences, so they override scores for the same suite.
    pub fn merge(file: FileConfig, args: Args) -> Self {
        let defaults = Self::default();

        let mut preferences: Preferences = file.preference_entries().collect();
        preferences.extend(args.prefer);

        let connect_timeout = args
            .connect_timeout
            .or(file.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        let tls_handshake_timeout = args
            .tls_timeout
            .or(file.tls_handshake_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.tls_handshake_timeout);
        let roots = if args.native_roots || file.native_roots {
            RootSource::Native
        } else {
            RootSource::Bundled
        };

        Self {
            preferences,
            connect_timeout,
            tls_handshake_timeout,
            roots,
            proxy: defaults.proxy,
            urls: args.urls,
        }
    }
}
