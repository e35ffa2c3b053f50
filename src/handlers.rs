//! Tunnel control commands
//!
//! The handlers behind `Ping`, `Connect`, `Disconnect`, `SetTunnelState` and
//! `Status`. Device work is delegated to a [`TunnelInterface`]; the manager
//! only tracks what was requested and reports it back.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::TunnelConfig;
use crate::crypto::x25519;
use crate::error::{HandlerError, TunnelError};
use crate::ipc::{CommandHandler, HandlerRegistry};

pub const PING: &str = "Ping";
pub const CONNECT: &str = "Connect";
pub const DISCONNECT: &str = "Disconnect";
pub const SET_TUNNEL_STATE: &str = "SetTunnelState";
pub const STATUS: &str = "Status";

/// The network interface the tunnel runs on
#[async_trait]
pub trait TunnelInterface: Send + Sync + 'static {
    /// Apply a configuration and bring the interface up
    async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError>;

    /// Enable or disable traffic on a configured interface
    async fn set_enabled(&self, enabled: bool) -> Result<(), TunnelError>;

    /// Remove the interface
    async fn teardown(&self) -> Result<(), TunnelError>;
}

#[derive(Debug, Clone, Default)]
struct Staged {
    configured: bool,
    enabled: bool,
    mtu: u16,
}

/// Interface that records the requested state without touching a device
#[derive(Debug, Default)]
pub struct StagedInterface {
    staged: StdMutex<Staged>,
}

impl StagedInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.staged.lock().map(|s| s.configured).unwrap_or(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.staged.lock().map(|s| s.enabled).unwrap_or(false)
    }

    fn update(&self, f: impl FnOnce(&mut Staged)) -> Result<(), String> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| "interface state poisoned".to_string())?;
        f(&mut staged);
        Ok(())
    }
}

#[async_trait]
impl TunnelInterface for StagedInterface {
    async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError> {
        tracing::info!(
            "Configuring interface: key {}, addresses {:?}, MTU {}",
            x25519::fingerprint(&config.public_key()),
            config.interface.address,
            config.mtu()
        );
        for peer in &config.peers {
            tracing::info!(
                "  peer {} endpoint {} allowed IPs {:?}",
                x25519::fingerprint(&peer.public_key),
                peer.endpoint
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
                peer.allowed_ips
            );
        }

        let mtu = config.mtu();
        self.update(|s| {
            s.configured = true;
            s.enabled = true;
            s.mtu = mtu;
        })
        .map_err(|reason| TunnelError::ConfigureFailed { reason })
    }

    async fn set_enabled(&self, enabled: bool) -> Result<(), TunnelError> {
        tracing::info!("Interface {}", if enabled { "enabled" } else { "disabled" });
        self.update(|s| s.enabled = enabled)
            .map_err(|reason| TunnelError::ConfigureFailed { reason })
    }

    async fn teardown(&self) -> Result<(), TunnelError> {
        tracing::info!("Removing interface");
        self.update(|s| *s = Staged::default())
            .map_err(|reason| TunnelError::TeardownFailed { reason })
    }
}

/// Tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connected,
}

/// Status reported to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub vpn_ip: Option<String>,
    pub server_endpoint: Option<String>,
    pub public_key: Option<String>,
    pub enabled: bool,
    /// Seconds since the Unix epoch
    pub connected_at: Option<String>,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            state: TunnelState::Disconnected,
            vpn_ip: None,
            server_endpoint: None,
            public_key: None,
            enabled: false,
            connected_at: None,
        }
    }
}

/// Tracks the tunnel on behalf of the command handlers
pub struct TunnelManager {
    interface: Arc<dyn TunnelInterface>,
    status: Mutex<TunnelStatus>,
}

impl TunnelManager {
    pub fn new(interface: Arc<dyn TunnelInterface>) -> Self {
        Self {
            interface,
            status: Mutex::new(TunnelStatus::default()),
        }
    }

    pub async fn connect(&self, config: TunnelConfig) -> Result<TunnelStatus, TunnelError> {
        let mut status = self.status.lock().await;
        if status.state == TunnelState::Connected {
            return Err(TunnelError::AlreadyConnected);
        }

        self.interface.configure(&config).await?;

        *status = TunnelStatus {
            state: TunnelState::Connected,
            vpn_ip: config.vpn_ip(),
            server_endpoint: config.server_endpoint().map(|e| e.to_string()),
            public_key: Some(config.public_key_base64()),
            enabled: true,
            connected_at: Some(epoch_now()),
        };
        tracing::info!(
            "Tunnel connected: {} via {}",
            status.vpn_ip.as_deref().unwrap_or("-"),
            status.server_endpoint.as_deref().unwrap_or("-")
        );
        Ok(status.clone())
    }

    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let mut status = self.status.lock().await;
        if status.state != TunnelState::Connected {
            return Err(TunnelError::NotConnected);
        }

        self.interface.teardown().await?;
        *status = TunnelStatus::default();
        tracing::info!("Tunnel disconnected");
        Ok(())
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<bool, TunnelError> {
        let mut status = self.status.lock().await;
        if status.state != TunnelState::Connected {
            return Err(TunnelError::NotConnected);
        }

        self.interface.set_enabled(enabled).await?;
        status.enabled = enabled;
        Ok(enabled)
    }

    pub async fn status(&self) -> TunnelStatus {
        self.status.lock().await.clone()
    }
}

fn epoch_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _payload: Value) -> Result<Value, HandlerError> {
        Ok(json!("pong"))
    }
}

/// Payload is the `.conf` text, either bare or as `{"config": "..."}`
pub struct ConnectHandler(pub Arc<TunnelManager>);

#[async_trait]
impl CommandHandler for ConnectHandler {
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let text = match &payload {
            Value::String(text) => text.as_str(),
            Value::Object(fields) => fields
                .get("config")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::new("Invalid payload: missing config"))?,
            _ => return Err(HandlerError::new("Invalid payload: expected config text")),
        };

        let config = TunnelConfig::parse(text)?;
        let status = self.0.connect(config).await?;
        Ok(json!({
            "connected": true,
            "vpn_ip": status.vpn_ip,
            "server_endpoint": status.server_endpoint,
            "public_key": status.public_key,
        }))
    }
}

pub struct DisconnectHandler(pub Arc<TunnelManager>);

#[async_trait]
impl CommandHandler for DisconnectHandler {
    async fn handle(&self, _payload: Value) -> Result<Value, HandlerError> {
        self.0.disconnect().await?;
        Ok(json!({"disconnected": true}))
    }
}

#[derive(Debug, Deserialize)]
struct SetTunnelStateParams {
    enabled: bool,
}

pub struct SetTunnelStateHandler(pub Arc<TunnelManager>);

#[async_trait]
impl CommandHandler for SetTunnelStateHandler {
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let params: SetTunnelStateParams = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(format!("Invalid payload: {}", e)))?;
        let enabled = self.0.set_enabled(params.enabled).await?;
        Ok(json!({"enabled": enabled}))
    }
}

pub struct StatusHandler(pub Arc<TunnelManager>);

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, _payload: Value) -> Result<Value, HandlerError> {
        let status = self.0.status().await;
        serde_json::to_value(status).map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// Registry with every tunnel command bound to `manager`
pub fn build_registry(manager: Arc<TunnelManager>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(PING, PingHandler)
        .register(CONNECT, ConnectHandler(Arc::clone(&manager)))
        .register(DISCONNECT, DisconnectHandler(Arc::clone(&manager)))
        .register(SET_TUNNEL_STATE, SetTunnelStateHandler(Arc::clone(&manager)))
        .register(STATUS, StatusHandler(manager));
    registry
}
