//! Process configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use folio_compile::{QueueConfig, ToolchainConfig};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub collab: folio_collab::ServerConfig,
    pub http: HttpConfig,
    pub queue: QueueConfig,
    pub toolchains: ToolchainConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("folio_data"),
            collab: folio_collab::ServerConfig::default(),
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            toolchains: ToolchainConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Values that do not
    /// parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("FOLIO_WS_ADDR") {
            config.collab.bind_addr = addr;
        }
        if let Some(addr) = lookup("FOLIO_HTTP_ADDR") {
            config.http.bind_addr = addr;
        }
        if let Some(dir) = lookup("FOLIO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "FOLIO_DEBOUNCE_MS") {
            config.collab.registry.debounce_window = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FOLIO_ROOM_IDLE_SECS") {
            config.collab.registry.room_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FOLIO_STORE_TIMEOUT_SECS") {
            config.collab.registry.store_timeout = Duration::from_secs(secs);
        }

        if let Some(limit) = parsed::<usize>(&lookup, "MAX_CONCURRENT_COMPILES") {
            if limit == 0 {
                log::warn!("Ignoring MAX_CONCURRENT_COMPILES=0");
            } else {
                config.queue.max_concurrent = limit;
            }
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FOLIO_JOB_RETENTION_SECS") {
            config.queue.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FOLIO_COMPILE_TIMEOUT_SECS") {
            config.queue.compile_timeout = Duration::from_secs(secs);
        }

        if let Some(bin) = lookup("FOLIO_LATEX_BIN") {
            config.toolchains.latex_bin = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("FOLIO_TYPST_BIN") {
            config.toolchains.typst_bin = PathBuf::from(bin);
        }
        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {name}={raw:?}, keeping default");
            None
        }
    }
}
