//! rumqttc-backed [`Session`] for running the nodes on a host machine.

use std::time::Duration;

use log::{info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::TransportLimits,
    link::{ServerEndpoint, Session, SessionError},
    rpc::{encode_key_value, route_publish, Inbound, RpcRequest, RpcResponse},
    topics::{rpc_response_topic, TOPIC_ATTRIBUTES, TOPIC_RPC_REQUEST_SUBSCRIBE, TOPIC_TELEMETRY},
};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct MqttSession {
    runtime: Handle,
    client_id: String,
    limits: TransportLimits,
    connect_timeout: Duration,
    active: Option<ActiveLink>,
}

struct ActiveLink {
    endpoint: ServerEndpoint,
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    methods: watch::Sender<Vec<&'static str>>,
    inbound: mpsc::Receiver<RpcRequest>,
    task: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MqttSession {
    /// `runtime` must outlive the session; the event loop runs as a task on it.
    pub fn new(
        runtime: Handle,
        client_id: impl Into<String>,
        limits: TransportLimits,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            client_id: client_id.into(),
            limits,
            connect_timeout,
            active: None,
        }
    }

    fn start(&self, endpoint: &ServerEndpoint) -> std::io::Result<ActiveLink> {
        let mut options = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        options.set_credentials(&endpoint.token, "");
        options.set_keep_alive(KEEP_ALIVE);

        if endpoint.encrypted {
            let ca = match &endpoint.root_ca_path {
                Some(path) => std::fs::read(path)?,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "encrypted link without a root CA",
                    ))
                }
            };
            options.set_transport(Transport::tls(ca, None, None));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (methods_tx, methods_rx) = watch::channel(Vec::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(self.limits.inbound_queue);

        let task = self.runtime.spawn(drive_event_loop(
            eventloop,
            client.clone(),
            self.limits.clone(),
            connected_tx,
            methods_rx,
            inbound_tx,
        ));

        Ok(ActiveLink {
            endpoint: endpoint.clone(),
            client,
            connected: connected_rx,
            methods: methods_tx,
            inbound: inbound_rx,
            task,
        })
    }

    fn connected_link(&mut self) -> Result<&mut ActiveLink, SessionError> {
        match self.active.as_mut() {
            Some(link) if *link.connected.borrow() => Ok(link),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn publish(&mut self, topic: String, body: Vec<u8>) -> Result<(), SessionError> {
        let link = self.connected_link()?;
        link.client
            .try_publish(topic, QoS::AtLeastOnce, false, body)
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    fn publish_key_value(&mut self, topic: &str, key: &str, value: Value) -> Result<(), SessionError> {
        let body = encode_key_value(key, &value, self.limits.max_send_bytes)?;
        self.publish(topic.to_string(), body)
    }
}

impl Session for MqttSession {
    fn is_connected(&mut self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|link| *link.connected.borrow())
    }

    fn connect(&mut self, endpoint: &ServerEndpoint) -> bool {
        if self
            .active
            .as_ref()
            .is_some_and(|link| &link.endpoint != endpoint)
        {
            self.active = None;
        }

        if self.active.is_none() {
            match self.start(endpoint) {
                Ok(link) => self.active = Some(link),
                Err(err) => {
                    warn!("failed to prepare mqtt transport: {err}");
                    return false;
                }
            }
        }

        let Some(link) = self.active.as_ref() else {
            return false;
        };
        let mut connected = link.connected.clone();
        let timeout = self.connect_timeout;
        self.runtime.block_on(async move {
            let waited = tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await;
            waited.is_ok_and(|changed| changed.is_ok())
        })
    }

    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        self.publish_key_value(TOPIC_ATTRIBUTES, key, value)
    }

    fn send_telemetry(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        self.publish_key_value(TOPIC_TELEMETRY, key, value)
    }

    fn subscribe_rpc(&mut self, methods: &[&'static str]) -> Result<(), SessionError> {
        let capacity = self.limits.max_rpc_subscriptions;
        if methods.len() > capacity {
            return Err(SessionError::TooManyMethods {
                requested: methods.len(),
                capacity,
            });
        }

        let link = self.connected_link()?;
        link.client
            .try_subscribe(TOPIC_RPC_REQUEST_SUBSCRIBE, QoS::AtLeastOnce)
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        link.methods.send_replace(methods.to_vec());
        Ok(())
    }

    fn next_request(&mut self) -> Option<RpcRequest> {
        self.active.as_mut()?.inbound.try_recv().ok()
    }

    fn respond(&mut self, request_id: u64, response: &RpcResponse) -> Result<(), SessionError> {
        let body = response.encode(self.limits.max_send_bytes)?;
        self.publish(rpc_response_topic(request_id), body)
    }

    /// The event loop task flushes traffic on its own.
    fn service(&mut self) {}
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    limits: TransportLimits,
    connected: watch::Sender<bool>,
    methods: watch::Receiver<Vec<&'static str>>,
    inbound: mpsc::Sender<RpcRequest>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                connected.send_replace(true);
                if !methods.borrow().is_empty() {
                    if let Err(err) = client.try_subscribe(TOPIC_RPC_REQUEST_SUBSCRIBE, QoS::AtLeastOnce) {
                        warn!("failed to renew rpc subscription: {err}");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                let routed = {
                    let methods = methods.borrow();
                    route_publish(&message.topic, &message.payload, limits.max_receive_bytes, &methods)
                };
                match routed {
                    Inbound::Request(request) => {
                        if let Err(err) = inbound.try_send(request) {
                            warn!("rpc queue full, dropping request: {err}");
                        }
                    }
                    Inbound::Reject { id, response } => {
                        match response.encode(limits.max_send_bytes) {
                            Ok(body) => {
                                if let Err(err) =
                                    client.try_publish(rpc_response_topic(id), QoS::AtLeastOnce, false, body)
                                {
                                    warn!("failed to answer rpc {id}: {err}");
                                }
                            }
                            Err(err) => warn!("failed to encode rpc {id} rejection: {err}"),
                        }
                    }
                    Inbound::Ignore => {}
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                connected.send_replace(false);
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt poll error: {err}");
                connected.send_replace(false);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}
