//! Hand-off between a transport's receiver thread and the device loop.
//!
//! The receiver side only flips flags and queues work. Anything that needs
//! the MQTT client (renewing the RPC subscription, answering an unknown
//! method) is taken by the loop thread in `Session::service`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
    Arc, Mutex,
};

use log::warn;

use crate::rpc::{route_publish, Inbound, RpcRequest, RpcResponse};

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    resubscribe: AtomicBool,
    methods: Mutex<Vec<&'static str>>,
}

/// Receiver-thread half.
pub struct InboxWriter {
    shared: Arc<Shared>,
    max_receive_bytes: usize,
    requests: SyncSender<RpcRequest>,
    rejections: SyncSender<(u64, RpcResponse)>,
}

/// Device-loop half.
pub struct Inbox {
    shared: Arc<Shared>,
    requests: Receiver<RpcRequest>,
    rejections: Receiver<(u64, RpcResponse)>,
}

/// Both queues hold at most `queue` entries; overflow is dropped with a warning.
pub fn inbox(queue: usize, max_receive_bytes: usize) -> (InboxWriter, Inbox) {
    let shared = Arc::new(Shared::default());
    let (request_tx, request_rx) = mpsc::sync_channel(queue);
    let (reject_tx, reject_rx) = mpsc::sync_channel(queue);

    (
        InboxWriter {
            shared: shared.clone(),
            max_receive_bytes,
            requests: request_tx,
            rejections: reject_tx,
        },
        Inbox {
            shared,
            requests: request_rx,
            rejections: reject_rx,
        },
    )
}

impl InboxWriter {
    pub fn connected(&self) {
        self.shared.resubscribe.store(true, Ordering::Relaxed);
        self.shared.connected.store(true, Ordering::Relaxed);
    }

    pub fn disconnected(&self) {
        self.shared.connected.store(false, Ordering::Relaxed);
    }

    pub fn received(&self, topic: &str, payload: &[u8]) {
        let routed = match self.shared.methods.lock() {
            Ok(methods) => route_publish(topic, payload, self.max_receive_bytes, &methods),
            Err(_) => Inbound::Ignore,
        };

        match routed {
            Inbound::Request(request) => {
                if let Err(TrySendError::Full(request)) = self.requests.try_send(request) {
                    warn!("rpc queue full, dropping request {}", request.id);
                }
            }
            Inbound::Reject { id, response } => {
                if let Err(TrySendError::Full(_)) = self.rejections.try_send((id, response)) {
                    warn!("rejection queue full, rpc {id} left unanswered");
                }
            }
            Inbound::Ignore => {}
        }
    }
}

impl Inbox {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn register(&self, methods: &[&'static str]) {
        if let Ok(mut registered) = self.shared.methods.lock() {
            *registered = methods.to_vec();
        }
        self.shared.resubscribe.store(false, Ordering::Relaxed);
    }

    /// True once per broker reconnect, and only after a batch was registered.
    pub fn take_resubscribe(&self) -> bool {
        if !self.shared.resubscribe.swap(false, Ordering::Relaxed) {
            return false;
        }
        self.shared
            .methods
            .lock()
            .map(|methods| !methods.is_empty())
            .unwrap_or(false)
    }

    /// Re-arms a renewal that could not be sent.
    pub fn retry_resubscribe(&self) {
        self.shared.resubscribe.store(true, Ordering::Relaxed);
    }

    pub fn next_request(&self) -> Option<RpcRequest> {
        self.requests.try_recv().ok()
    }

    pub fn take_rejections(&self) -> Vec<(u64, RpcResponse)> {
        self.rejections.try_iter().collect()
    }
}
