//! Host identity: resolution, registration with the server, and liveness heartbeats.
//!
//! A node starts unregistered; a failed registration aborts startup.

use crate::config::{NodeConfig, AUTO};
use crate::event::NodeIdentity;
use crate::uplink::{ApiClient, ApiError, HeartbeatRequest, NodeInfo, NodeRegistrationRequest};
use parking_lot::RwLock;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Registered => write!(f, "registered"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node registration failed: {0}")]
    Registration(#[source] ApiError),
    #[error("heartbeat failed: {0}")]
    Heartbeat(#[source] ApiError),
}

pub struct NodeManager {
    api: Arc<dyn ApiClient>,
    identity: RwLock<NodeIdentity>,
}

impl NodeManager {
    /// Resolves hostname and address now; the node stays unregistered until [`register`](Self::register).
    pub fn new(config: &NodeConfig, api: Arc<dyn ApiClient>) -> Self {
        let hostname = resolve_hostname(config);
        let ip_address = resolve_ip_address(config, &hostname);
        let group = config.group.clone().filter(|g| !g.trim().is_empty());
        Self::with_identity(
            NodeIdentity {
                hostname,
                ip_address,
                group,
                assigned_id: None,
            },
            api,
        )
    }

    pub fn with_identity(identity: NodeIdentity, api: Arc<dyn ApiClient>) -> Self {
        Self {
            api,
            identity: RwLock::new(identity),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity.read().clone()
    }

    pub fn hostname(&self) -> String {
        self.identity.read().hostname.clone()
    }

    pub fn node_id(&self) -> Option<i64> {
        self.identity.read().assigned_id
    }

    pub fn state(&self) -> RegistrationState {
        if self.identity.read().is_registered() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// Sends this host's identity to the server and stores the assigned id.
    pub async fn register(&self) -> Result<i64, NodeError> {
        let request = {
            let id = self.identity.read();
            NodeRegistrationRequest {
                hostname: id.hostname.clone(),
                ip_address: id.ip_address.clone(),
                group: id.group.clone(),
            }
        };
        info!(
            hostname = %request.hostname,
            ip_address = %request.ip_address,
            group = request.group.as_deref().unwrap_or("none"),
            "registering node with server"
        );

        let node: NodeInfo = match self.api.register(&request).await {
            Ok(node) => node,
            Err(e) => {
                error!(error = %e, "failed to register node with server");
                return Err(NodeError::Registration(e));
            }
        };

        self.identity.write().assigned_id = Some(node.id);
        info!(node_id = node.id, status = %node.status, "node registered");
        Ok(node.id)
    }

    /// One liveness signal. Never changes registration state.
    pub async fn send_heartbeat(&self) -> Result<NodeInfo, NodeError> {
        let request = HeartbeatRequest {
            hostname: self.hostname(),
        };
        let node = self
            .api
            .heartbeat(&request)
            .await
            .map_err(NodeError::Heartbeat)?;
        debug!(status = %node.status, "heartbeat sent");
        Ok(node)
    }
}

fn resolve_hostname(config: &NodeConfig) -> String {
    if !config.hostname.eq_ignore_ascii_case(AUTO) && !config.hostname.trim().is_empty() {
        return config.hostname.clone();
    }
    match hostname::get() {
        Ok(h) => h.to_string_lossy().to_string(),
        Err(e) => {
            warn!(error = %e, "failed to read hostname, using localhost");
            "localhost".to_string()
        }
    }
}

fn resolve_ip_address(config: &NodeConfig, hostname: &str) -> String {
    if !config.ip_address.eq_ignore_ascii_case(AUTO) && !config.ip_address.trim().is_empty() {
        return config.ip_address.clone();
    }
    match (hostname, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            if let Some(ip) = first_routable_ipv4(addrs.map(|a| a.ip())) {
                return ip.to_string();
            }
            warn!(hostname, "no non-loopback IPv4 address found, using 127.0.0.1");
        }
        Err(e) => {
            warn!(hostname, error = %e, "failed to auto-detect IP address, using 127.0.0.1");
        }
    }
    Ipv4Addr::LOCALHOST.to_string()
}

fn first_routable_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
        _ => None,
    })
}
