use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "BRIEFKASTEN_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Accounts keyed by their short id (e.g. `myaccount`).
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    pub imap: ImapConfig,
    /// Optional outgoing endpoint; kept for completeness, delivery is out
    /// of scope.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Root of the mirror: store, index, composite history, eml files, and
    /// attachments all live beneath it.
    pub data_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Trust all certificates.
    #[serde(default)]
    pub insecure: bool,
    /// Validate the server certificate against this host name instead of
    /// the connection host.
    #[serde(default)]
    pub ssl_trust: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("briefkasten");
        Ok(dir.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [accounts.myaccount]\n\
                 email = \"you@example.com\"\n\
                 data_path = \"/home/you/mail/myaccount\"\n\n\
                 [accounts.myaccount.imap]\n\
                 host = \"imap.example.com\"\n\
                 user = \"you@example.com\"\n\
                 pass = \"secret\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.accounts.is_empty() {
            anyhow::bail!("configuration has no accounts");
        }
        Ok(config)
    }

    /// Look up an account by id; a missing account is a fatal
    /// configuration error.
    pub fn account(&self, id: &str) -> Result<&AccountConfig> {
        self.accounts
            .get(id)
            .with_context(|| format!("account '{}' not found in configuration", id))
    }
}
