//! Public ingress for webhook delivery.
//!
//! The manager owns the tunnel session and the notification target that
//! points at it. Providers with a finite session lifetime are rotated ahead
//! of expiry; a failed rotation is retried after a cooldown until it works.

pub mod ngrok;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{TunnelConfig, TunnelKind};
use crate::error::SyncError;
use crate::remote::RemoteClient;
use crate::retry::RetryExecutor;

pub const WEBHOOK_PATH: &str = "/webhook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Active,
    Rotating,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Base URL, without the webhook path.
    fn public_url(&self) -> &str;
    async fn close(&mut self) -> Result<(), SyncError>;
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn open(&self, port: u16) -> Result<Box<dyn TunnelSession>, SyncError>;
    /// How long one session stays usable. `None` never expires.
    fn session_lifetime(&self) -> Option<Duration>;
}

/// A public URL managed outside the process, e.g. a reverse proxy.
pub struct StaticProvider {
    url: String,
}

impl StaticProvider {
    pub fn new(url: String) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

struct StaticSession(String);

#[async_trait]
impl TunnelSession for StaticSession {
    fn public_url(&self) -> &str {
        &self.0
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

#[async_trait]
impl TunnelProvider for StaticProvider {
    async fn open(&self, _port: u16) -> Result<Box<dyn TunnelSession>, SyncError> {
        Ok(Box::new(StaticSession(self.url.clone())))
    }

    fn session_lifetime(&self) -> Option<Duration> {
        None
    }
}

pub fn provider_from_config(config: &TunnelConfig) -> anyhow::Result<Arc<dyn TunnelProvider>> {
    Ok(match config.provider {
        TunnelKind::Ngrok => Arc::new(ngrok::NgrokProvider::new(
            config.binary.clone(),
            Duration::from_secs(config.session_lifetime_secs),
        )),
        TunnelKind::Static => {
            let url = config
                .public_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("tunnel.public_url is required for the static provider"))?;
            Arc::new(StaticProvider::new(url))
        }
    })
}

/// Where the notification target lives and what it is called.
#[derive(Debug, Clone)]
pub struct Registration {
    pub scope: String,
    pub label: String,
}

pub struct TunnelSessionManager {
    provider: Arc<dyn TunnelProvider>,
    remote: Arc<dyn RemoteClient>,
    retry: RetryExecutor,
    registration: Registration,
    port: u16,
    rotation_margin: Duration,
    failure_cooldown: Duration,
    state: watch::Sender<TunnelState>,
    url: watch::Sender<Option<String>>,
    session: Option<Box<dyn TunnelSession>>,
    target_id: Option<String>,
}

impl TunnelSessionManager {
    pub fn new(
        provider: Arc<dyn TunnelProvider>,
        remote: Arc<dyn RemoteClient>,
        retry: RetryExecutor,
        registration: Registration,
        port: u16,
        rotation_margin: Duration,
        failure_cooldown: Duration,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Stopped);
        let (url, _) = watch::channel(None);
        Self {
            provider,
            remote,
            retry,
            registration,
            port,
            rotation_margin,
            failure_cooldown,
            state,
            url,
            session: None,
            target_id: None,
        }
    }

    /// Current public URL, `None` while no tunnel is up.
    pub fn url(&self) -> watch::Receiver<Option<String>> {
        self.url.subscribe()
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: TunnelState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "tunnel state");
        }
    }

    /// Time until the next rotation, if the provider's sessions expire.
    fn rotation_interval(&self) -> Option<Duration> {
        self.provider
            .session_lifetime()
            .map(|lifetime| lifetime.saturating_sub(self.rotation_margin))
    }

    /// Open the first session and register it. Errors here are fatal to the
    /// daemon, so the manager is left in `Failed` for the caller to report.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        self.set_state(TunnelState::Starting);
        match self.open_and_register().await {
            Ok(()) => {
                self.set_state(TunnelState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(TunnelState::Failed);
                Err(e)
            }
        }
    }

    /// Replace the current session with a fresh one.
    pub async fn rotate(&mut self) -> Result<(), SyncError> {
        self.set_state(TunnelState::Rotating);
        self.close_session().await;
        match self.open_and_register().await {
            Ok(()) => {
                self.set_state(TunnelState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(TunnelState::Failed);
                Err(e)
            }
        }
    }

    async fn open_and_register(&mut self) -> Result<(), SyncError> {
        let mut session = self.provider.open(self.port).await?;
        let webhook_url = format!("{}{WEBHOOK_PATH}", session.public_url());

        let Registration { scope, label } = &self.registration;
        let registered = self
            .retry
            .run("upsert_notification_target", || {
                self.remote
                    .upsert_notification_target(&webhook_url, scope, label)
            })
            .await;
        let target_id = match registered {
            Ok(id) => id,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(error = %close_err, "failed to close unregistered tunnel");
                }
                return Err(e);
            }
        };

        info!(url = %webhook_url, target = %target_id, "webhook registered");
        self.url.send_replace(Some(session.public_url().to_string()));
        self.session = Some(session);
        self.target_id = Some(target_id);
        Ok(())
    }

    async fn close_session(&mut self) {
        self.url.send_replace(None);
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "failed to close tunnel");
            }
        }
    }

    /// Close the tunnel and delete the notification target.
    pub async fn shutdown(&mut self) {
        self.close_session().await;
        if let Some(target_id) = self.target_id.take() {
            match self.remote.delete_notification_target(&target_id).await {
                Ok(()) => info!(target = %target_id, "webhook unregistered"),
                Err(e) => warn!(target = %target_id, error = %e, "failed to unregister webhook"),
            }
        }
        self.set_state(TunnelState::Stopped);
    }

    /// Keep the session alive until `shutdown` flips, then tear it down.
    /// Expects `start` to have been called.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.state() {
                TunnelState::Active => self.rotation_interval(),
                TunnelState::Failed => Some(self.failure_cooldown),
                _ => None,
            };
            let sleep_for = wait.unwrap_or(Duration::from_secs(86_400));

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep_for), if wait.is_some() => {
                    let failed = self.state() == TunnelState::Failed;
                    match self.rotate().await {
                        Ok(()) => info!(recovered = failed, "tunnel rotated"),
                        Err(e) => error!(
                            error = %e,
                            retry_in = ?self.failure_cooldown,
                            "tunnel rotation failed"
                        ),
                    }
                }
            }
        }
        self.shutdown().await;
    }
}
