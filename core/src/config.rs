//! TOML configuration for the engine host

use crate::connection::ConnectSettings;
use crate::reconnect::{
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECEIVE_TIMEOUT,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration: one `[[servers]]` table per connection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One server connection as configured on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub nickname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub realname: String,
    pub password: Option<String>,
    pub local_address: Option<String>,
    /// Channels to join once registered.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_delay")]
    pub connect_delay: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout: u64,
    #[serde(default = "default_respawn")]
    pub respawn: bool,
}

fn default_port() -> u16 {
    6667
}

fn default_connect_attempts() -> u32 {
    DEFAULT_CONNECT_ATTEMPTS
}

fn default_connect_delay() -> u64 {
    DEFAULT_CONNECT_DELAY
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_receive_timeout() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT
}

fn default_respawn() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration out as TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(Error::Config("server host cannot be empty".to_string()));
            }
            if server.port == 0 {
                return Err(Error::Config(format!(
                    "server {} has an invalid port",
                    server.host
                )));
            }
            if server.nickname.is_empty() {
                return Err(Error::Config(format!(
                    "server {} has no nickname",
                    server.host
                )));
            }
            if server.connect_attempts == 0 {
                return Err(Error::Config(format!(
                    "server {} must allow at least one connect attempt",
                    server.host
                )));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "irc.example.net".to_string(),
            port: default_port(),
            nickname: "mybot".to_string(),
            username: String::new(),
            realname: String::new(),
            password: None,
            local_address: None,
            channels: vec!["#lobby".to_string()],
            connect_attempts: default_connect_attempts(),
            connect_delay: default_connect_delay(),
            connect_timeout: default_connect_timeout(),
            receive_timeout: default_receive_timeout(),
            respawn: default_respawn(),
        }
    }
}

impl ServerConfig {
    /// Turn this entry into connect settings, filling the username and
    /// realname from the nickname when omitted.
    pub fn to_settings(&self) -> ConnectSettings {
        let username = if self.username.is_empty() {
            self.nickname.clone()
        } else {
            self.username.clone()
        };
        let realname = if self.realname.is_empty() {
            self.nickname.clone()
        } else {
            self.realname.clone()
        };
        ConnectSettings {
            host: self.host.clone(),
            port: self.port,
            nickname: self.nickname.clone(),
            realname,
            username,
            local_address: self.local_address.clone(),
            password: self.password.clone(),
            connect_attempts: self.connect_attempts,
            connect_delay: self.connect_delay,
            connect_timeout: self.connect_timeout,
            receive_timeout: self.receive_timeout,
            respawn: self.respawn,
        }
    }
}
