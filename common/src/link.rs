use std::{thread, time::Duration};

use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{LinkConfig, NetworkConfig},
    rpc::{RpcError, RpcRequest, RpcResponse},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not connected")]
    NotConnected,
    #[error("payload of {size} bytes exceeds the {limit} byte bound")]
    Oversized { size: usize, limit: usize },
    #[error("{requested} rpc methods exceed the transport limit of {capacity}")]
    TooManyMethods { requested: usize, capacity: usize },
    #[error("transport rejected request: {0}")]
    Transport(String),
}

impl From<RpcError> for SessionError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Oversized { size, limit } => Self::Oversized { size, limit },
            other => Self::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("network not associated after {waits} waits")]
    NetworkUnavailable { waits: u32 },
}

/// Access point association, owned by the board layer.
pub trait Network {
    /// Kicks off association; completion is observed through [`Network::is_associated`].
    fn begin(&mut self);
    fn is_associated(&mut self) -> bool;
}

/// Publish/subscribe session to the cloud endpoint.
pub trait Session {
    fn is_connected(&mut self) -> bool;
    /// One connect attempt. Returns whether the session is up afterwards.
    fn connect(&mut self, endpoint: &ServerEndpoint) -> bool;
    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError>;
    fn send_telemetry(&mut self, key: &str, value: Value) -> Result<(), SessionError>;
    /// Registers the whole method batch; the transport answers unknown methods itself.
    fn subscribe_rpc(&mut self, methods: &[&'static str]) -> Result<(), SessionError>;
    fn next_request(&mut self) -> Option<RpcRequest>;
    fn respond(&mut self, request_id: u64, response: &RpcResponse) -> Result<(), SessionError>;
    /// Flushes queued outbound traffic and keeps the session alive.
    fn service(&mut self);
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub encrypted: bool,
    pub root_ca_path: Option<String>,
}

impl From<&NetworkConfig> for ServerEndpoint {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            host: network.server_host.clone(),
            port: network.server_port,
            token: network.device_token.clone(),
            encrypted: network.encrypted,
            root_ca_path: network.root_ca_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkWait {
    pub step_ms: u64,
    pub max_waits: Option<u32>,
}

impl From<&LinkConfig> for NetworkWait {
    fn from(link: &LinkConfig) -> Self {
        Self {
            step_ms: link.network_poll_ms,
            max_waits: link.network_wait_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub network_associated: bool,
    pub session_connected: bool,
}

/// Connection manager shared by the relay and sensor nodes.
pub struct Link<N, S, D> {
    network: N,
    session: S,
    delay: D,
    endpoint: ServerEndpoint,
    wait: NetworkWait,
    connectivity: Connectivity,
}

impl<N: Network, S: Session, D: Delay> Link<N, S, D> {
    pub fn new(network: N, session: S, delay: D, endpoint: ServerEndpoint, wait: NetworkWait) -> Self {
        Self {
            network,
            session,
            delay,
            endpoint,
            wait,
            connectivity: Connectivity::default(),
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    pub fn delay_ms(&mut self, ms: u64) {
        self.delay.delay_ms(ms);
    }

    /// Blocks until the access point is associated, one fixed step per failed poll.
    /// Returns the number of waits issued.
    pub fn ensure_network(&mut self) -> Result<u32, LinkError> {
        let mut waits = 0_u32;
        let mut started = false;

        while !self.network.is_associated() {
            if !started {
                self.connectivity = Connectivity::default();
                info!("connecting to access point");
                self.network.begin();
                started = true;
            }

            if let Some(limit) = self.wait.max_waits {
                if waits >= limit {
                    warn!("access point still unavailable after {waits} waits, giving up");
                    return Err(LinkError::NetworkUnavailable { waits });
                }
            }

            self.delay.delay_ms(self.wait.step_ms);
            waits = waits.saturating_add(1);
        }

        if started {
            info!("connected to access point after {waits} waits");
        }
        self.connectivity.network_associated = true;
        Ok(waits)
    }

    /// Connects the session if needed. Failure is logged and reported, never fatal.
    pub fn ensure_session(&mut self) -> bool {
        if self.session.is_connected() {
            self.connectivity.session_connected = true;
            return true;
        }

        info!(
            "connecting to {}:{}",
            self.endpoint.host, self.endpoint.port
        );
        let connected = self.session.connect(&self.endpoint);
        if !connected {
            warn!(
                "failed to connect to {}:{}",
                self.endpoint.host, self.endpoint.port
            );
        }
        self.connectivity.session_connected = connected;
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{link_with, MockNetwork, MockSession};

    #[test]
    fn waits_once_per_failed_poll() {
        for k in [0_u32, 1, 3, 10] {
            let mut link = link_with(MockNetwork::associated_after(k), MockSession::online());

            assert_eq!(link.ensure_network().unwrap(), k);
            assert_eq!(link.delay().calls(), vec![500; k as usize]);
            assert_eq!(link.network().polls(), k + 1);
            assert!(link.connectivity().network_associated);
        }
    }

    #[test]
    fn association_started_only_when_missing() {
        let mut link = link_with(MockNetwork::associated_after(0), MockSession::online());
        link.ensure_network().unwrap();
        assert_eq!(link.network().begins(), 0);

        let mut link = link_with(MockNetwork::associated_after(2), MockSession::online());
        link.ensure_network().unwrap();
        assert_eq!(link.network().begins(), 1);
    }

    #[test]
    fn bounded_wait_gives_up() {
        let mut link = link_with(MockNetwork::associated_after(10), MockSession::online());
        link.wait.max_waits = Some(3);

        let err = link.ensure_network().unwrap_err();

        assert!(matches!(err, LinkError::NetworkUnavailable { waits: 3 }));
        assert_eq!(link.delay().calls().len(), 3);
        assert!(!link.connectivity().network_associated);
    }

    #[test]
    fn failed_connect_is_reported() {
        let mut link = link_with(MockNetwork::associated_after(0), MockSession::offline());

        assert!(!link.ensure_session());
        assert!(!link.connectivity().session_connected);
        assert_eq!(link.session().connect_attempts(), 1);
    }

    #[test]
    fn connected_session_skips_connect() {
        let mut link = link_with(MockNetwork::associated_after(0), MockSession::online());

        assert!(link.ensure_session());
        assert_eq!(link.session().connect_attempts(), 0);
    }

    #[test]
    fn connect_uses_configured_endpoint() {
        let mut session = MockSession::offline();
        session.accept_connects(true);
        let mut link = link_with(MockNetwork::associated_after(0), session);

        assert!(link.ensure_session());
        assert_eq!(link.session().endpoints()[0].host, "tb.test");
        assert_eq!(link.session().endpoints()[0].token, "token");
    }
}
