//! Twinkly xled API sender.
//!
//! The xled protocol authenticates with a short-lived token obtained through
//! a login/verify handshake. A background task re-logins at half the token's
//! declared expiry. When no device is configured the sender is a no-op, so
//! the rest of the pipeline needs no special casing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::errors::Error;
use crate::resolver::ProtocolCommand;

type Result<T> = std::result::Result<T, Error>;

const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct LoginRequest {
    challenge: &'static str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    authentication_token: String,
    #[serde(default)]
    authentication_token_expires_in: u64,
}

#[derive(Debug, Serialize)]
struct ModeRequest {
    mode: &'static str,
}

pub struct TwinklySender {
    client: reqwest::Client,
    ip: Option<String>,
    token: RwLock<String>,
}

impl TwinklySender {
    /// Build from the first configured Twinkly device, or a no-op sender
    /// when there is none.
    pub fn new(configuration: &Configuration) -> Arc<Self> {
        let ip = configuration
            .twinkly
            .values()
            .next()
            .map(|device| device.ip.clone());
        if configuration.twinkly.len() > 1 {
            warn!("Multiple Twinkly devices configured; only the first is driven");
        }
        Arc::new(TwinklySender {
            client: reqwest::Client::new(),
            ip,
            token: RwLock::new(String::new()),
        })
    }

    /// Login/verify handshake. Returns the token's declared expiry in
    /// seconds; zero when no device is configured.
    pub async fn login(&self) -> Result<u64> {
        let Some(ip) = self.ip.as_deref() else {
            return Ok(0);
        };

        let login = self
            .client
            .post(format!("http://{ip}/xled/v1/login"))
            .json(&LoginRequest { challenge: "test" })
            .send()
            .await?
            .error_for_status()?
            .json::<LoginResponse>()
            .await?;

        self.client
            .post(format!("http://{ip}/xled/v1/verify"))
            .header("X-Auth-Token", &login.authentication_token)
            .send()
            .await?
            .error_for_status()?;

        debug!(
            "Twinkly login verified; token expires in {}s",
            login.authentication_token_expires_in
        );
        *self.token.write().await = login.authentication_token;
        Ok(login.authentication_token_expires_in)
    }

    /// Keep the auth token fresh until cancelled. Re-login happens at half
    /// the declared expiry; failures retry after a short delay.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.ip.is_none() {
            return;
        }

        let mut sleep = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(sleep) => {}
            }

            sleep = match self.login().await {
                Ok(expires_in) => Duration::from_secs(expires_in.max(2) / 2),
                Err(err) => {
                    error!("error logging in and verifying twinkly connection: {err}");
                    LOGIN_RETRY_DELAY
                }
            };
        }
    }

    pub async fn send(&self, command: &ProtocolCommand) -> Result<()> {
        let Some(ip) = self.ip.as_deref() else {
            return Ok(());
        };

        let mode = match command {
            ProtocolCommand::TurnOn => {
                debug!("Turning on Twinkly lights");
                ModeRequest { mode: "movie" }
            }
            ProtocolCommand::TurnOff => {
                debug!("Turning off Twinkly lights");
                ModeRequest { mode: "off" }
            }
            other => {
                warn!("Twinkly does not support command {other:?}; dropping");
                return Ok(());
            }
        };

        let token = self.token.read().await.clone();
        self.client
            .post(format!("http://{ip}/xled/v1/led/mode"))
            .header("X-Auth-Token", token)
            .json(&mode)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
