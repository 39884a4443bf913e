//! ESP-IDF MQTT [`Session`] for the boards.

use std::{
    thread,
    time::{Duration, Instant},
};

use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration};
use log::{info, warn};
use serde_json::Value;

use crate::{
    config::TransportLimits,
    inbox::{inbox, Inbox, InboxWriter},
    link::{ServerEndpoint, Session, SessionError},
    rpc::{encode_key_value, RpcRequest, RpcResponse},
    topics::{rpc_response_topic, TOPIC_ATTRIBUTES, TOPIC_RPC_REQUEST_SUBSCRIBE, TOPIC_TELEMETRY},
};

const CONNECT_POLL: Duration = Duration::from_millis(50);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

struct Active {
    client: EspMqttClient<'static>,
    inbox: Inbox,
}

pub struct EspMqttSession {
    client_id: &'static str,
    limits: TransportLimits,
    connect_timeout: Duration,
    active: Option<Active>,
}

impl EspMqttSession {
    pub fn new(client_id: &'static str, limits: TransportLimits, connect_timeout: Duration) -> Self {
        Self {
            client_id,
            limits,
            connect_timeout,
            active: None,
        }
    }

    fn start(&mut self, endpoint: &ServerEndpoint) -> Result<(), SessionError> {
        let scheme = if endpoint.encrypted { "mqtts" } else { "mqtt" };
        let url = format!("{scheme}://{}:{}", endpoint.host, endpoint.port);

        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id),
            username: Some(endpoint.token.as_str()),
            keep_alive_interval: Some(KEEP_ALIVE),
            crt_bundle_attach: if endpoint.encrypted {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| SessionError::Transport(format!("{err:?}")))?;
        let (writer, inbox) = inbox(self.limits.inbound_queue, self.limits.max_receive_bytes);

        spawn_receiver(conn, writer).map_err(|err| SessionError::Transport(err.to_string()))?;

        self.active = Some(Active { client, inbox });
        Ok(())
    }

    fn connected(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.inbox.is_connected())
    }

    fn subscribe(&mut self) -> Result<(), SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NotConnected)?;
        active
            .client
            .subscribe(TOPIC_RPC_REQUEST_SUBSCRIBE, QoS::AtLeastOnce)
            .map(|_| ())
            .map_err(|err| SessionError::Transport(format!("{err:?}")))
    }

    fn renew_subscription(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.inbox.take_resubscribe() {
            return;
        }
        match self.subscribe() {
            Ok(()) => info!("rpc subscription renewed"),
            Err(err) => {
                warn!("failed to renew rpc subscription: {err}");
                if let Some(active) = &self.active {
                    active.inbox.retry_resubscribe();
                }
            }
        }
    }

    fn answer_rejections(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        for (id, response) in active.inbox.take_rejections() {
            if let Err(err) = self.respond(id, &response) {
                warn!("failed to answer rpc {id}: {err}");
            }
        }
    }

    fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), SessionError> {
        if !self.connected() {
            return Err(SessionError::NotConnected);
        }
        let active = self.active.as_mut().ok_or(SessionError::NotConnected)?;
        active
            .client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .map(|_| ())
            .map_err(|err| SessionError::Transport(format!("{err:?}")))
    }
}

impl Session for EspMqttSession {
    fn is_connected(&mut self) -> bool {
        self.connected()
    }

    fn connect(&mut self, endpoint: &ServerEndpoint) -> bool {
        if self.active.is_none() {
            if let Err(err) = self.start(endpoint) {
                warn!("failed to start mqtt client: {err}");
                return false;
            }
        }

        // The client reconnects on its own; this only waits for the outcome.
        let deadline = Instant::now() + self.connect_timeout;
        while !self.connected() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(CONNECT_POLL);
        }
        true
    }

    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let body = encode_key_value(key, &value, self.limits.max_send_bytes)?;
        self.publish(TOPIC_ATTRIBUTES, &body)
    }

    fn send_telemetry(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let body = encode_key_value(key, &value, self.limits.max_send_bytes)?;
        self.publish(TOPIC_TELEMETRY, &body)
    }

    fn subscribe_rpc(&mut self, methods: &[&'static str]) -> Result<(), SessionError> {
        let capacity = self.limits.max_rpc_subscriptions;
        if methods.len() > capacity {
            return Err(SessionError::TooManyMethods {
                requested: methods.len(),
                capacity,
            });
        }

        self.subscribe()?;
        if let Some(active) = &self.active {
            active.inbox.register(methods);
        }
        Ok(())
    }

    fn next_request(&mut self) -> Option<RpcRequest> {
        self.active.as_ref()?.inbox.next_request()
    }

    fn respond(&mut self, request_id: u64, response: &RpcResponse) -> Result<(), SessionError> {
        let body = response.encode(self.limits.max_send_bytes)?;
        self.publish(&rpc_response_topic(request_id), &body)
    }

    /// Runs the client calls the receiver thread deferred. Outbound traffic
    /// itself is flushed by the ESP-IDF MQTT task.
    fn service(&mut self) {
        if !self.connected() {
            return;
        }
        self.renew_subscription();
        self.answer_rejections();
    }
}

/// Drains connection events. Never calls the client: the ESP-IDF MQTT task
/// holds its API lock until each event is released.
fn spawn_receiver(mut conn: EspMqttConnection, inbox: InboxWriter) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        inbox.connected();
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        inbox.disconnected();
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => inbox.received(topic, data),
                    EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
                    _ => {}
                }
            }
            inbox.disconnected();
            info!("mqtt connection closed");
        })
        .map(|_| ())
}
