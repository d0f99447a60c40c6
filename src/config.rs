//! Runtime configuration loaded from the environment
//!
//! Every required value is read once at startup; anything missing or
//! malformed aborts the process before a single connection is opened.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::{Error, Result};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SIP domain embedded in minted credentials
    pub server_domain: String,
    /// Public address of the SIP server
    pub server_ip: String,
    pub ari_host: String,
    pub ari_port: u16,
    pub ari_user: String,
    pub ari_password: String,
    /// Application name the engine routes doorphone channels into
    pub ari_app_name: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,
    /// TTL for call/channel/endpoint/outgoing records (seconds)
    pub call_token_ttl_sec: u64,
    /// Ring timer and pending-originate TTL (seconds)
    pub ring_timeout_sec: u64,
    /// HTTP API port
    pub app_port: u16,
    /// Recipient user id for doorphone pushes
    pub realphone: String,
    /// Optional push vendor credential
    pub push_access_token: Option<String>,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{} is required", name)))
}

fn required_parsed<T: FromStr>(name: &str) -> Result<T> {
    required(name)?
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value", name)))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server_domain: required("SERVER_DOMAIN")?,
            server_ip: required("SERVER_IP")?,
            ari_host: required("ARI_HOST")?,
            ari_port: required_parsed("ARI_PORT")?,
            ari_user: required("ARI_USER")?,
            ari_password: required("ARI_PASSWORD")?,
            ari_app_name: required("ARI_APP_NAME")?,
            redis_host: required("REDIS_HOST")?,
            redis_port: required_parsed("REDIS_PORT")?,
            redis_password: required("REDIS_PASSWORD")?,
            postgres_host: required("POSTGRES_HOST")?,
            postgres_port: required_parsed("POSTGRES_PORT")?,
            postgres_db: required("POSTGRES_DB")?,
            postgres_user: required("POSTGRES_USER")?,
            postgres_password: required("POSTGRES_PASSWORD")?,
            call_token_ttl_sec: required_parsed("CALL_TOKEN_TTL_SEC")?,
            ring_timeout_sec: required_parsed("RING_TIMEOUT_SEC")?,
            app_port: required_parsed("APP_PORT")?,
            realphone: required("REALPHONE")?,
            push_access_token: std::env::var("PUSH_ACCESS_TOKEN").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks; the ring timer must never outlive the records
    /// it inspects.
    pub fn validate(&self) -> Result<()> {
        if self.call_token_ttl_sec < self.ring_timeout_sec {
            return Err(Error::Config(format!(
                "CALL_TOKEN_TTL_SEC ({}) must be >= RING_TIMEOUT_SEC ({})",
                self.call_token_ttl_sec, self.ring_timeout_sec
            )));
        }
        if self.ring_timeout_sec == 0 {
            return Err(Error::Config("RING_TIMEOUT_SEC must be positive".to_string()));
        }
        Ok(())
    }

    /// Get socket address for binding the HTTP API
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.app_port))
    }

    /// REST base of the telephony engine
    pub fn ari_base_url(&self) -> String {
        format!("http://{}:{}/ari", self.ari_host, self.ari_port)
    }

    /// Event-stream socket of the telephony engine. Credentials go into
    /// the Authorization header, never into this URL.
    pub fn ari_ws_url(&self) -> String {
        format!(
            "ws://{}:{}/ari/events?app={}&subscribeAll=false",
            self.ari_host, self.ari_port, self.ari_app_name
        )
    }

    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/", self.redis_host, self.redis_port)
        } else {
            format!(
                "redis://:{}@{}:{}/",
                self.redis_password, self.redis_host, self.redis_port
            )
        }
    }
}
