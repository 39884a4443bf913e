//! Scripted collaborators for driving the node state machines in tests.

use std::collections::VecDeque;

use serde_json::Value;

use crate::{
    actuator::Actuator,
    link::{Delay, Link, Network, NetworkWait, ServerEndpoint, Session, SessionError},
    relay::{PinError, RelayPins},
    rpc::{RpcRequest, RpcResponse},
    sensor::SensorSource,
};

pub fn endpoint() -> ServerEndpoint {
    ServerEndpoint {
        host: "tb.test".to_string(),
        port: 1883,
        token: "token".to_string(),
        encrypted: false,
        root_ca_path: None,
    }
}

pub fn link_with(
    network: MockNetwork,
    session: MockSession,
) -> Link<MockNetwork, MockSession, MockDelay> {
    Link::new(
        network,
        session,
        MockDelay::default(),
        endpoint(),
        NetworkWait {
            step_ms: 500,
            max_waits: None,
        },
    )
}

#[derive(Debug, Default)]
pub struct MockNetwork {
    pending_failures: u32,
    polls: u32,
    begins: u32,
}

impl MockNetwork {
    /// Reports "not associated" for the first `k` polls.
    pub fn associated_after(k: u32) -> Self {
        Self {
            pending_failures: k,
            ..Self::default()
        }
    }

    pub fn drop_for(&mut self, polls: u32) {
        self.pending_failures = polls;
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn begins(&self) -> u32 {
        self.begins
    }
}

impl Network for MockNetwork {
    fn begin(&mut self) {
        self.begins += 1;
    }

    fn is_associated(&mut self) -> bool {
        self.polls += 1;
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            false
        } else {
            true
        }
    }
}

#[derive(Debug, Default)]
pub struct MockDelay {
    calls: Vec<u64>,
}

impl MockDelay {
    pub fn calls(&self) -> Vec<u64> {
        self.calls.clone()
    }
}

impl Delay for MockDelay {
    fn delay_ms(&mut self, ms: u64) {
        self.calls.push(ms);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub key: String,
    pub value: Value,
    pub delivered: bool,
}

#[derive(Debug, Default)]
pub struct MockSession {
    connected: bool,
    accept_connects: bool,
    connect_attempts: u32,
    endpoints: Vec<ServerEndpoint>,
    attributes: Vec<Sent>,
    telemetry: Vec<Sent>,
    subscribe_calls: Vec<Vec<&'static str>>,
    subscribe_failures: u32,
    fail_sends: bool,
    inbound: VecDeque<RpcRequest>,
    responses: Vec<(u64, RpcResponse)>,
    services: u32,
}

impl MockSession {
    pub fn online() -> Self {
        Self {
            connected: true,
            accept_connects: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn accept_connects(&mut self, accept: bool) {
        self.accept_connects = accept;
    }

    pub fn drop_connection(&mut self) {
        self.connected = false;
    }

    /// Refuses attribute and telemetry sends while the link stays up.
    pub fn fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    pub fn fail_next_subscribes(&mut self, count: u32) {
        self.subscribe_failures = count;
    }

    pub fn push_request(&mut self, request: RpcRequest) {
        self.inbound.push_back(request);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }

    pub fn attributes(&self) -> &[Sent] {
        &self.attributes
    }

    pub fn telemetry(&self) -> &[Sent] {
        &self.telemetry
    }

    pub fn telemetry_for(&self, key: &str) -> Vec<Value> {
        self.telemetry
            .iter()
            .filter(|sent| sent.key == key)
            .map(|sent| sent.value.clone())
            .collect()
    }

    pub fn subscribe_calls(&self) -> &[Vec<&'static str>] {
        &self.subscribe_calls
    }

    pub fn responses(&self) -> &[(u64, RpcResponse)] {
        &self.responses
    }

    pub fn services(&self) -> u32 {
        self.services
    }

    fn record(log: &mut Vec<Sent>, outcome: Result<(), SessionError>, key: &str, value: Value) -> Result<(), SessionError> {
        log.push(Sent {
            key: key.to_string(),
            value,
            delivered: outcome.is_ok(),
        });
        outcome
    }

    fn send_outcome(&self) -> Result<(), SessionError> {
        if !self.connected {
            Err(SessionError::NotConnected)
        } else if self.fail_sends {
            Err(SessionError::Transport("publish refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Session for MockSession {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn connect(&mut self, endpoint: &ServerEndpoint) -> bool {
        self.connect_attempts += 1;
        self.endpoints.push(endpoint.clone());
        self.connected = self.accept_connects;
        self.connected
    }

    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let outcome = self.send_outcome();
        Self::record(&mut self.attributes, outcome, key, value)
    }

    fn send_telemetry(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let outcome = self.send_outcome();
        Self::record(&mut self.telemetry, outcome, key, value)
    }

    fn subscribe_rpc(&mut self, methods: &[&'static str]) -> Result<(), SessionError> {
        self.subscribe_calls.push(methods.to_vec());
        if self.subscribe_failures > 0 {
            self.subscribe_failures -= 1;
            return Err(SessionError::Transport("suback refused".to_string()));
        }
        Ok(())
    }

    fn next_request(&mut self) -> Option<RpcRequest> {
        self.inbound.pop_front()
    }

    fn respond(&mut self, request_id: u64, response: &RpcResponse) -> Result<(), SessionError> {
        self.responses.push((request_id, response.clone()));
        Ok(())
    }

    fn service(&mut self) {
        self.services += 1;
    }
}

#[derive(Debug, Default)]
pub struct MockPins {
    writes: Vec<(Actuator, bool)>,
    fail_writes: bool,
}

impl MockPins {
    pub fn writes(&self) -> &[(Actuator, bool)] {
        &self.writes
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl RelayPins for MockPins {
    fn write(&mut self, actuator: Actuator, energized: bool) -> Result<(), PinError> {
        if self.fail_writes {
            return Err(PinError(format!("gpio for {actuator} unavailable")));
        }
        self.writes.push((actuator, energized));
        Ok(())
    }
}

/// Replays a fixed script of samples, repeating the last one when exhausted.
#[derive(Debug, Default)]
pub struct ScriptedSensors {
    pub climate: VecDeque<Option<(f32, f32)>>,
    pub voc: VecDeque<Option<u16>>,
    pub lux: Option<f32>,
    pub battery_v: Option<f32>,
    pub voc_reads: u32,
}

impl ScriptedSensors {
    fn next<T: Copy>(queue: &mut VecDeque<Option<T>>) -> Option<T> {
        if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().copied().flatten()
        }
    }
}

impl SensorSource for ScriptedSensors {
    fn read_climate(&mut self) -> Option<(f32, f32)> {
        Self::next(&mut self.climate)
    }

    fn read_voc_index(&mut self, _temperature_c: f32, _humidity: f32) -> Option<u16> {
        self.voc_reads += 1;
        Self::next(&mut self.voc)
    }

    fn read_lux(&mut self) -> Option<f32> {
        self.lux
    }

    fn read_battery_v(&mut self) -> Option<f32> {
        self.battery_v
    }
}
