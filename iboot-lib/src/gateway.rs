//! Z-Wave gateway client.
//!
//! The gateway exposes a JSON RPC façade over MQTT: each RPC kind has a
//! `<api>/<method>/set` request topic and an un-suffixed response topic.
//! Firmware packets travel through the `sendCommand` RPC as
//! Manufacturer-Proprietary `sendAndReceiveData` calls; node identity is
//! read through `driverFunction`.
//!
//! Correlation is a single pending-reply slot per RPC kind: calls on one
//! kind are strictly serial, the dispatch task fills the slot's waiter,
//! and a response arriving with no waiter is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet as MqttPacket, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{product_code, COMMAND_CLASS_PROPRIETARY, EXCHANGE_TIMEOUT, MANUFACTURER_ID};
use crate::error::UpdateError;
use crate::transport::Transport;

const METHOD_SEND_AND_RECEIVE: &str = "sendAndReceiveData";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Broker URL, e.g. `mqtt://192.168.1.10:1883`.
    pub mqtt_url: String,
    /// API root the gateway listens under.
    pub api_topic: String,
    /// Target Z-Wave node.
    pub node_id: u8,
}

/// Identity of a node as reported by the gateway driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

impl NodeInfo {
    /// Map this node to an archive product code, or explain why not.
    pub fn product_code(&self) -> Result<&'static str, UpdateError> {
        product_code(self.manufacturer_id, self.product_type, self.product_id).ok_or_else(|| {
            UpdateError::UnsupportedNode(format!(
                "manufacturer 0x{:04X}, product 0x{:04X}:0x{:04X} is not a known controller",
                self.manufacturer_id, self.product_type, self.product_id
            ))
        })
    }
}

type PendingSlot = Arc<Mutex<Option<oneshot::Sender<Value>>>>;

pub struct GatewayClient {
    client: AsyncClient,
    node_id: u8,
    send_command_topic: String,
    driver_function_topic: String,
    send_command_pending: PendingSlot,
    driver_function_pending: PendingSlot,
}

impl GatewayClient {
    /// Connect to the broker, subscribe to both response topics and start
    /// the dispatch task. Subscriptions are released when the client is
    /// dropped and the dispatch task winds down.
    pub async fn connect(config: &GatewayConfig) -> Result<Self, UpdateError> {
        let (host, port) = parse_mqtt_url(&config.mqtt_url)?;
        info!("connecting to broker at {host}:{port}");

        let client_id = format!("iboot-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, event_loop) = AsyncClient::new(options, 64);

        let send_command_response = format!("{}/sendCommand", config.api_topic);
        let driver_function_response = format!("{}/driverFunction", config.api_topic);
        client
            .subscribe(&send_command_response, QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(&driver_function_response, QoS::AtLeastOnce)
            .await?;

        let send_command_pending: PendingSlot = Arc::default();
        let driver_function_pending: PendingSlot = Arc::default();
        spawn_dispatch(
            event_loop,
            send_command_response,
            driver_function_response,
            Arc::clone(&send_command_pending),
            Arc::clone(&driver_function_pending),
        );

        Ok(Self {
            client,
            node_id: config.node_id,
            send_command_topic: format!("{}/sendCommand/set", config.api_topic),
            driver_function_topic: format!("{}/driverFunction/set", config.api_topic),
            send_command_pending,
            driver_function_pending,
        })
    }

    /// One Manufacturer-Proprietary exchange: send `data` to the node and
    /// return the reply packet, or `None` if the exchange timed out.
    pub async fn send_command(&self, data: &[u8]) -> Result<Option<Bytes>, UpdateError> {
        let request = send_command_request(self.node_id, data);
        match self
            .call(&self.send_command_topic, &self.send_command_pending, &request)
            .await?
        {
            Some(response) => parse_send_command_response(self.node_id, &response).map(Some),
            None => Ok(None),
        }
    }

    /// Run a snippet of code in the gateway driver and return its result.
    pub async fn driver_function(&self, code: &str) -> Result<Value, UpdateError> {
        let request = json!({ "args": [code] });
        let response = self
            .call(&self.driver_function_topic, &self.driver_function_pending, &request)
            .await?
            .ok_or_else(|| transport_err("no response to driver function call"))?;
        parse_driver_function_response(code, &response)
    }

    /// Read the target node's identity from the gateway driver.
    pub async fn node_info(&self) -> Result<NodeInfo, UpdateError> {
        let code = node_info_function(self.node_id);
        let result = self.driver_function(&code).await?;
        serde_json::from_value(result)
            .map_err(|e| transport_err(format!("malformed node info: {e}")))
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    async fn call(
        &self,
        topic: &str,
        pending: &PendingSlot,
        request: &Value,
    ) -> Result<Option<Value>, UpdateError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = pending.lock().await;
            if slot.is_some() {
                warn!("discarding stale reply waiter on {topic}");
            }
            *slot = Some(tx);
        }

        let payload = serde_json::to_vec(request)
            .map_err(|e| transport_err(format!("failed to encode request: {e}")))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;

        match timeout(EXCHANGE_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(_)) => Err(transport_err("gateway connection closed")),
            Err(_) => {
                pending.lock().await.take();
                Ok(None)
            }
        }
    }
}

/// The real transport: forwards packets through the gateway RPC.
pub struct GatewayTransport {
    client: GatewayClient,
}

impl GatewayTransport {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }
}

impl Transport for GatewayTransport {
    async fn send_and_receive(&mut self, packet: &[u8]) -> Result<Option<Bytes>, UpdateError> {
        self.client.send_command(packet).await
    }
}

/// Format the controller clock bytes of a diagnostic reply as `HH:MM`.
pub fn format_node_time(reply: &[u8]) -> Result<String, UpdateError> {
    if reply.len() < 16 {
        return Err(transport_err(format!(
            "diagnostic reply of {} bytes is too short to carry the clock",
            reply.len()
        )));
    }
    Ok(format!("{:02}:{:02}", reply[14], reply[15]))
}

fn spawn_dispatch(
    mut event_loop: EventLoop,
    send_command_topic: String,
    driver_function_topic: String,
    send_command_pending: PendingSlot,
    driver_function_pending: PendingSlot,
) {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(MqttPacket::Publish(publish))) => {
                    let slot = if publish.topic == send_command_topic {
                        &send_command_pending
                    } else if publish.topic == driver_function_topic {
                        &driver_function_pending
                    } else {
                        debug!("ignoring message on {}", publish.topic);
                        continue;
                    };
                    let value: Value = match serde_json::from_slice(&publish.payload) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("malformed gateway response on {}: {e}", publish.topic);
                            continue;
                        }
                    };
                    match slot.lock().await.take() {
                        Some(waiter) => {
                            let _ = waiter.send(value);
                        }
                        None => debug!("response on {} with no waiter, dropped", publish.topic),
                    }
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => {
                    debug!("gateway client closed, dispatch task exiting");
                    break;
                }
                Err(e) => {
                    warn!("MQTT connection error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

fn parse_mqtt_url(url: &str) -> Result<(String, u16), UpdateError> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    if stripped.is_empty() {
        return Err(transport_err(format!("invalid MQTT URL: {url}")));
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| transport_err(format!("invalid MQTT port in {url}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

fn node_info_function(node_id: u8) -> String {
    format!(
        "const node = driver.controller.nodes.get({node_id}); \
         return {{ manufacturerId: node.manufacturerId, productType: node.productType, \
         productId: node.productId, firmwareVersion: node.firmwareVersion }};"
    )
}

fn send_command_request(node_id: u8, data: &[u8]) -> Value {
    json!({
        "args": [
            {
                "nodeId": node_id,
                "endpoint": 0,
                "commandClass": COMMAND_CLASS_PROPRIETARY,
            },
            METHOD_SEND_AND_RECEIVE,
            [MANUFACTURER_ID, { "type": "Buffer", "data": data }],
        ]
    })
}

fn parse_send_command_response(node_id: u8, response: &Value) -> Result<Bytes, UpdateError> {
    ensure_success(response)?;

    let args = response
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| transport_err("response has no args echo"))?;
    let target = args
        .first()
        .ok_or_else(|| transport_err("response args echo is empty"))?;
    if target.get("nodeId").and_then(Value::as_u64) != Some(node_id as u64)
        || target.get("endpoint").and_then(Value::as_u64) != Some(0)
        || target.get("commandClass").and_then(Value::as_u64)
            != Some(COMMAND_CLASS_PROPRIETARY as u64)
    {
        return Err(transport_err("response echoes a different target"));
    }
    if args.get(1).and_then(Value::as_str) != Some(METHOD_SEND_AND_RECEIVE) {
        return Err(transport_err("response echoes a different method"));
    }

    let data = response
        .pointer("/result/data/data")
        .and_then(Value::as_array)
        .ok_or_else(|| transport_err("response carries no reply bytes"))?;
    let mut bytes = Vec::with_capacity(data.len());
    for value in data {
        let byte = value
            .as_u64()
            .filter(|byte| *byte <= 0xFF)
            .ok_or_else(|| transport_err("reply byte out of range"))?;
        bytes.push(byte as u8);
    }
    Ok(Bytes::from(bytes))
}

fn parse_driver_function_response(code: &str, response: &Value) -> Result<Value, UpdateError> {
    ensure_success(response)?;
    if response.pointer("/args/0").and_then(Value::as_str) != Some(code) {
        return Err(transport_err("driver function response echoes different code"));
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn ensure_success(response: &Value) -> Result<(), UpdateError> {
    if response.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let message = response
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed");
    Err(transport_err(format!("gateway rejected the request: {message}")))
}

fn transport_err(message: impl Into<String>) -> UpdateError {
    UpdateError::TransportIo(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(node_id: u8, reply: &[u8]) -> Value {
        json!({
            "success": true,
            "args": [
                { "nodeId": node_id, "endpoint": 0, "commandClass": 145 },
                "sendAndReceiveData",
            ],
            "result": { "data": { "type": "Buffer", "data": reply } },
        })
    }

    #[test]
    fn send_command_request_shape() {
        let request = send_command_request(23, &[42, 0]);
        assert_eq!(request.pointer("/args/0/nodeId"), Some(&json!(23)));
        assert_eq!(request.pointer("/args/0/endpoint"), Some(&json!(0)));
        assert_eq!(request.pointer("/args/0/commandClass"), Some(&json!(145)));
        assert_eq!(request.pointer("/args/1"), Some(&json!("sendAndReceiveData")));
        assert_eq!(request.pointer("/args/2/0"), Some(&json!(5)));
        assert_eq!(request.pointer("/args/2/1/data"), Some(&json!([42, 0])));
    }

    #[test]
    fn send_command_response_is_validated() {
        let reply = parse_send_command_response(23, &sample_response(23, &[42, 3, 0, 0])).unwrap();
        assert_eq!(&reply[..], &[42, 3, 0, 0]);

        // Echo for a different node is a hard error.
        assert!(parse_send_command_response(24, &sample_response(23, &[42])).is_err());

        // An unsuccessful response is a hard error.
        let mut failed = sample_response(23, &[]);
        failed["success"] = json!(false);
        failed["message"] = json!("node not found");
        let err = parse_send_command_response(23, &failed).unwrap_err();
        assert!(err.to_string().contains("node not found"));

        // Reply bytes must be bytes.
        let mut oversized = sample_response(23, &[]);
        oversized["result"]["data"]["data"] = json!([300]);
        assert!(parse_send_command_response(23, &oversized).is_err());
    }

    #[test]
    fn driver_function_response_must_echo_code() {
        let code = node_info_function(9);
        let response = json!({
            "success": true,
            "args": [code.clone()],
            "result": {
                "manufacturerId": 5,
                "productType": 0x5045,
                "productId": 0x0653,
                "firmwareVersion": "3.44",
            },
        });
        let result = parse_driver_function_response(&code, &response).unwrap();
        let info: NodeInfo = serde_json::from_value(result).unwrap();
        assert_eq!(info.product_code().unwrap(), "PE0653");
        assert_eq!(info.firmware_version.as_deref(), Some("3.44"));

        let mismatched = json!({ "success": true, "args": ["something else"], "result": {} });
        assert!(parse_driver_function_response(&code, &mismatched).is_err());
    }

    #[test]
    fn unknown_nodes_are_refused() {
        let info = NodeInfo {
            manufacturer_id: 5,
            product_type: 0x5045,
            product_id: 0x9999,
            firmware_version: None,
        };
        assert!(matches!(
            info.product_code(),
            Err(UpdateError::UnsupportedNode(_))
        ));
    }

    #[test]
    fn clock_formatting() {
        let mut reply = vec![0u8; 16];
        reply[14] = 7;
        reply[15] = 5;
        assert_eq!(format_node_time(&reply).unwrap(), "07:05");
        assert!(format_node_time(&reply[..15]).is_err());
    }

    #[test]
    fn broker_urls() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_mqtt_url("tcp://10.0.0.2").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert!(parse_mqtt_url("mqtt://").is_err());
    }
}
