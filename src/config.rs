use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use thiserror::Error;

use crate::mail_client::DEFAULT_BASE_URL;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub port: u16,
    pub is_production: bool,
    pub mail_base_url: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("AGENTMAIL_API_KEY environment variable is required")]
    MissingApiKey,
    #[error("PORT must be a valid u16")]
    InvalidPort,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("AGENTMAIL_API_KEY")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let port = lookup("PORT")
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let is_production = ["APP_ENV", "NODE_ENV"]
            .into_iter()
            .any(|key| lookup(key).as_deref().map(str::trim) == Some("production"));

        let mail_base_url = lookup("AGENTMAIL_BASE_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            api_key,
            port,
            is_production,
            mail_base_url,
        })
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Production listens on all interfaces, development on loopback only.
    pub fn bind_socket(&self) -> SocketAddr {
        let ip = if self.is_production {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, self.port)
    }
}
