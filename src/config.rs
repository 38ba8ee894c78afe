use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::MessageKind;
use crate::sync::model::SyncMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Parent of all conversation folders
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
    /// Hierarchy separator; discovered from the server when unset
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub chat_mode: SyncMode,
    /// Mode for SMS and MMS
    #[serde(default)]
    pub xms_mode: SyncMode,
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
    #[serde(default = "default_connectivity_debounce_secs")]
    pub connectivity_debounce_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_folder: default_root_folder(),
            separator: None,
            chat_mode: SyncMode::default(),
            xms_mode: SyncMode::default(),
            periodic_interval_secs: default_periodic_interval_secs(),
            connectivity_debounce_secs: default_connectivity_debounce_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl SyncConfig {
    pub fn mode_for(&self, kind: MessageKind) -> SyncMode {
        if kind.is_xms() {
            self.xms_mode
        } else {
            self.chat_mode
        }
    }

    /// Kinds synchronized over IMAP.
    pub fn imap_kinds(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .filter(|kind| self.mode_for(*kind) == SyncMode::Imap)
            .collect()
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }

    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_secs(self.connectivity_debounce_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file (default: in the local data directory)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_root_folder() -> String {
    "default".to_string()
}

fn default_periodic_interval_secs() -> u64 {
    900
}

fn default_connectivity_debounce_secs() -> u64 {
    5
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("cmsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("cmsync");
        Ok(dir)
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("messages.db")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [server]\n\
                 host = \"cms.example.com\"\n\
                 username = \"+15550001111\"\n\n\
                 [sync]\n\
                 root_folder = \"default\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        if let Some(parent) = self.store_path()?.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
