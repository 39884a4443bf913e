use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    actuator::{Actuator, ActuatorStates},
    link::{Delay, Link, LinkError, Network, Session},
    rpc::{decode_enabled, DispatchTable, RpcError, RpcHandler, RpcRequest, RpcResponse},
    topics::KEY_VERSION,
};

#[derive(Debug, Error)]
#[error("pin write failed: {0}")]
pub struct PinError(pub String);

/// Drives the physical relay outputs. `true` energizes the relay.
pub trait RelayPins {
    fn write(&mut self, actuator: Actuator, energized: bool) -> Result<(), PinError>;
}

/// Startup actions that run once per boot, never again on reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootFlags {
    pub initial_attributes_published: bool,
    pub rpc_subscribed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session could not be established; retried next tick.
    SessionUnavailable,
    /// RPC registration was refused; retried next tick.
    SubscribeFailed,
    /// The transport was serviced and `handled` commands dispatched.
    Serviced { handled: usize },
}

pub struct RelayNode<N, S, P, D> {
    link: Link<N, S, D>,
    pins: P,
    states: ActuatorStates,
    flags: BootFlags,
    dispatch: DispatchTable,
    version: String,
    idle_ms: u64,
    initial_publish_failures: Vec<&'static str>,
}

impl<N: Network, S: Session, P: RelayPins, D: Delay> RelayNode<N, S, P, D> {
    /// Builds the node and its dispatch table. Every relay is driven low once so the
    /// outputs match the de-energized boot state.
    pub fn new(
        link: Link<N, S, D>,
        mut pins: P,
        version: impl Into<String>,
        max_rpc_subscriptions: usize,
    ) -> Result<Self, RpcError> {
        let dispatch = DispatchTable::relays(max_rpc_subscriptions)?;

        for actuator in Actuator::ALL {
            if let Err(err) = pins.write(actuator, false) {
                warn!("failed to drive {actuator} relay low at boot: {err}");
            }
        }

        Ok(Self {
            link,
            pins,
            states: ActuatorStates::default(),
            flags: BootFlags::default(),
            dispatch,
            version: version.into(),
            idle_ms: 0,
            initial_publish_failures: Vec::new(),
        })
    }

    pub fn with_idle_ms(mut self, idle_ms: u64) -> Self {
        self.idle_ms = idle_ms;
        self
    }

    pub fn link(&self) -> &Link<N, S, D> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<N, S, D> {
        &mut self.link
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn flags(&self) -> BootFlags {
        self.flags
    }

    pub fn states(&self) -> &ActuatorStates {
        &self.states
    }

    /// Boot attribute keys whose one-shot publish failed. They are not retried.
    pub fn initial_publish_failures(&self) -> &[&'static str] {
        &self.initial_publish_failures
    }

    pub fn get(&self, actuator: Actuator) -> bool {
        self.states.get(actuator)
    }

    /// Applies `desired` to the relay and republishes it. Returns the resulting state.
    pub fn set(&mut self, actuator: Actuator, desired: bool) -> bool {
        info!("changing {actuator} relay to {desired}");

        if let Err(err) = self.pins.write(actuator, desired) {
            warn!("{actuator} relay left at {}: {err}", self.states.get(actuator));
            return self.states.get(actuator);
        }
        self.states.record(actuator, desired);

        self.link.ensure_session();
        if let Err(err) = self
            .link
            .session_mut()
            .send_attribute(actuator.key(), Value::Bool(desired))
        {
            warn!("failed to publish {}: {err}", actuator.key());
        }

        desired
    }

    pub fn set_switch(&mut self, actuator: Actuator, params: &Value) -> Result<bool, RpcError> {
        let desired = decode_enabled(params)?;
        Ok(self.set(actuator, desired))
    }

    pub fn get_switch(&self, actuator: Actuator) -> RpcResponse {
        RpcResponse::status(actuator, self.get(actuator))
    }

    pub fn handle_request(&mut self, request: &RpcRequest) -> RpcResponse {
        info!("received rpc `{}`", request.method);

        match self.dispatch.resolve(&request.method) {
            Some(RpcHandler::Set(actuator)) => match self.set_switch(actuator, &request.params) {
                Ok(state) => RpcResponse::state(state),
                Err(err) => {
                    warn!("rejecting `{}`: {err}", request.method);
                    RpcResponse::error(&err)
                }
            },
            Some(RpcHandler::Get(actuator)) => self.get_switch(actuator),
            None => {
                let err = RpcError::unknown_method(&request.method);
                warn!("rejecting rpc: {err}");
                RpcResponse::error(&err)
            }
        }
    }

    /// One pass of the bootstrap/reconnect loop.
    pub fn tick(&mut self) -> Result<TickOutcome, LinkError> {
        self.link.ensure_network()?;

        if !self.link.ensure_session() {
            return Ok(TickOutcome::SessionUnavailable);
        }

        if !self.flags.initial_attributes_published {
            self.publish_initial_attributes();
            self.flags.initial_attributes_published = true;
        }

        if !self.flags.rpc_subscribed {
            info!("subscribing for rpc");
            let methods = self.dispatch.methods();
            if let Err(err) = self.link.session_mut().subscribe_rpc(&methods) {
                warn!("failed to subscribe for rpc: {err}");
                return Ok(TickOutcome::SubscribeFailed);
            }
            info!("subscribed {} rpc methods", methods.len());
            self.flags.rpc_subscribed = true;
        }

        let handled = self.service_transport();
        Ok(TickOutcome::Serviced { handled })
    }

    /// Runs the loop for the device lifetime. Only a bounded network wait can end it.
    pub fn run(&mut self) -> Result<(), LinkError> {
        loop {
            self.tick()?;
            if self.idle_ms > 0 {
                self.link.delay_ms(self.idle_ms);
            }
        }
    }

    fn publish_initial_attributes(&mut self) {
        info!("sending boot attributes");

        let mut attributes = vec![(KEY_VERSION, Value::String(self.version.clone()))];
        attributes.extend(
            self.states
                .iter()
                .map(|(actuator, energized)| (actuator.key(), Value::Bool(energized))),
        );

        let session = self.link.session_mut();
        for (key, value) in attributes {
            if let Err(err) = session.send_attribute(key, value) {
                warn!("boot attribute {key} not published: {err}");
                self.initial_publish_failures.push(key);
            }
        }
    }

    fn service_transport(&mut self) -> usize {
        self.link.session_mut().service();

        let mut handled = 0;
        while let Some(request) = self.link.session_mut().next_request() {
            let response = self.handle_request(&request);
            if let Err(err) = self.link.session_mut().respond(request.id, &response) {
                warn!("failed to answer rpc {}: {err}", request.id);
            }
            handled += 1;
        }
        handled
    }
}
