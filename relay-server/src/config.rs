//! Configuration loading and hot-reload, modeled on `ConfHandle` in
//! `devolutions-gateway/src/config.rs`: a JSON file on disk, an in-memory
//! `Conf` derived from it, and a `Notify` waking anything that cares about a
//! live reload. Unlike the teacher, there is no TLS/PFX material to parse —
//! the relay core does not terminate TLS (`spec.md` Non-goals).

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

const DATA_DIR_ENV: &str = "RELAY_CONFIG_PATH";
const CONF_FILE_NAME: &str = "relay-core.json";
const IDENTITY_KEY_FILE_NAME: &str = "identity.key";

fn default_bind_address() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default socket address")
}

fn default_reverse_bind_address() -> SocketAddr {
    "0.0.0.0:8081".parse().expect("valid default socket address")
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_lease_tick_interval_secs() -> u64 {
    30
}

fn default_reverse_pool_capacity() -> usize {
    64
}

fn default_reverse_keepalive_interval_secs() -> u64 {
    25
}

fn default_reverse_acquire_timeout_secs() -> u64 {
    2
}

fn default_auth_failure_throttle_secs() -> u64 {
    2
}

fn default_host_round_trip_timeout_secs() -> u64 {
    10
}

/// On-disk configuration shape, serialized directly as `relay-core.json`.
/// Every field is optional with the defaults named in `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfFile {
    pub bind_address: SocketAddr,
    pub reverse_bind_address: SocketAddr,
    pub log_level: String,
    pub lease_tick_interval_secs: u64,
    pub per_lease_splice_cap: Option<usize>,
    pub global_splice_cap: Option<usize>,
    pub reverse_pool_capacity: usize,
    pub reverse_keepalive_interval_secs: u64,
    pub reverse_acquire_timeout_secs: u64,
    pub auth_failure_throttle_secs: u64,
    pub host_round_trip_timeout_secs: u64,
    pub name_pattern: Option<String>,
    pub ttl_bounds_secs: Option<(i64, i64)>,
    pub advertised_addresses: Vec<String>,
}

impl Default for ConfFile {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            reverse_bind_address: default_reverse_bind_address(),
            log_level: default_log_level(),
            lease_tick_interval_secs: default_lease_tick_interval_secs(),
            per_lease_splice_cap: None,
            global_splice_cap: None,
            reverse_pool_capacity: default_reverse_pool_capacity(),
            reverse_keepalive_interval_secs: default_reverse_keepalive_interval_secs(),
            reverse_acquire_timeout_secs: default_reverse_acquire_timeout_secs(),
            auth_failure_throttle_secs: default_auth_failure_throttle_secs(),
            host_round_trip_timeout_secs: default_host_round_trip_timeout_secs(),
            name_pattern: None,
            ttl_bounds_secs: None,
            advertised_addresses: Vec::new(),
        }
    }
}

/// The validated, in-memory configuration derived from [`ConfFile`].
pub struct Conf {
    pub bind_address: SocketAddr,
    pub reverse_bind_address: SocketAddr,
    pub log_level: String,
    pub lease_tick_interval: std::time::Duration,
    pub per_lease_splice_cap: Option<usize>,
    pub global_splice_cap: Option<usize>,
    pub reverse_pool_capacity: usize,
    pub reverse_keepalive_interval: std::time::Duration,
    pub reverse_acquire_timeout: std::time::Duration,
    pub auth_failure_throttle: std::time::Duration,
    pub host_round_trip_timeout: std::time::Duration,
    pub name_pattern: Option<Regex>,
    pub ttl_bounds: Option<(time::Duration, time::Duration)>,
    pub advertised_addresses: Vec<String>,
}

impl Conf {
    fn from_conf_file(conf_file: &ConfFile) -> anyhow::Result<Self> {
        let name_pattern = conf_file
            .name_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid name_pattern")?;

        let ttl_bounds = conf_file
            .ttl_bounds_secs
            .map(|(min, max)| (time::Duration::seconds(min), time::Duration::seconds(max)));

        Ok(Self {
            bind_address: conf_file.bind_address,
            reverse_bind_address: conf_file.reverse_bind_address,
            log_level: conf_file.log_level.clone(),
            lease_tick_interval: std::time::Duration::from_secs(conf_file.lease_tick_interval_secs),
            per_lease_splice_cap: conf_file.per_lease_splice_cap,
            global_splice_cap: conf_file.global_splice_cap,
            reverse_pool_capacity: conf_file.reverse_pool_capacity,
            reverse_keepalive_interval: std::time::Duration::from_secs(conf_file.reverse_keepalive_interval_secs),
            reverse_acquire_timeout: std::time::Duration::from_secs(conf_file.reverse_acquire_timeout_secs),
            auth_failure_throttle: std::time::Duration::from_secs(conf_file.auth_failure_throttle_secs),
            host_round_trip_timeout: std::time::Duration::from_secs(conf_file.host_round_trip_timeout_secs),
            name_pattern,
            ttl_bounds,
            advertised_addresses: conf_file.advertised_addresses.clone(),
        })
    }
}

/// Configuration handle: source of truth for the current configuration
/// state. Cheap to clone; every clone observes the same live value.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    changed: Notify,
}

impl ConfHandle {
    /// Loads (or generates) the configuration file and derives a [`Conf`] from it.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                changed: Notify::new(),
            }),
        })
    }

    /// Returns the current configuration state. Do not hold it forever, as
    /// it may become outdated after a reload.
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Waits until the configuration has been reloaded.
    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    /// Re-reads the configuration file from disk and swaps it in, waking
    /// anything waiting on [`ConfHandle::change_notified`].
    pub fn reload(&self) -> anyhow::Result<()> {
        let conf_file_path = get_conf_file_path();
        let conf_file = load_conf_file(&conf_file_path)
            .context("failed to reload configuration")?
            .context("configuration file disappeared")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        *self.inner.conf.write() = Arc::new(conf);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(path) = env::var(DATA_DIR_ENV) {
        Utf8PathBuf::from(path)
    } else if cfg!(target_os = "windows") {
        let program_data = env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
        Utf8PathBuf::from(program_data).join("relay-core")
    } else {
        Utf8PathBuf::from("/etc/relay-core")
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join(CONF_FILE_NAME)
}

pub fn identity_key_path() -> Utf8PathBuf {
    get_data_dir().join(IDENTITY_KEY_FILE_NAME)
}

fn load_conf_file(path: &Utf8PathBuf) -> anyhow::Result<Option<ConfFile>> {
    match File::open(path) {
        Ok(file) => serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .with_context(|| format!("invalid config file at {path}")),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(anyhow::Error::new(error).context(format!("couldn't open config file at {path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<ConfFile> {
    let path = get_conf_file_path();

    match load_conf_file(&path).context("failed to load configuration")? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let defaults = ConfFile::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
            }
            let json = serde_json::to_string_pretty(&defaults).context("failed to serialize default configuration")?;
            std::fs::write(&path, json).with_context(|| format!("failed to write default configuration at {path}"))?;
            Ok(defaults)
        }
    }
}
