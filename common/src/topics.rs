pub const TOPIC_ATTRIBUTES: &str = "v1/devices/me/attributes";
pub const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";

pub const TOPIC_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const TOPIC_RPC_REQUEST_SUBSCRIBE: &str = "v1/devices/me/rpc/request/+";
pub const TOPIC_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

pub const KEY_VERSION: &str = "VERSION";

pub const KEY_TEMPERATURE: &str = "temperature";
pub const KEY_HUMIDITY: &str = "humidity";
pub const KEY_VOC: &str = "voc";
pub const KEY_LUX: &str = "lux";
pub const KEY_BATTERY: &str = "battery";

pub fn rpc_request_id(topic: &str) -> Option<u64> {
    topic
        .strip_prefix(TOPIC_RPC_REQUEST_PREFIX)
        .and_then(|id| id.parse().ok())
}

pub fn rpc_response_topic(request_id: u64) -> String {
    format!("{TOPIC_RPC_RESPONSE_PREFIX}{request_id}")
}
