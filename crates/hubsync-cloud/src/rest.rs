//! REST client for snapshot fetches and IO writes.
//!
//! Every call is a signed JSON envelope posted to `{base}/api.{method}`.
//! A response carries a top-level `code`; batch writes additionally carry one
//! code per command in `data`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use hubsync_commands::{Command, HubWriter, SpeedTier, WireError};
use hubsync_core::config::AccountConfig;
use hubsync_core::{BridgeConfig, Error, Result};
use hubsync_devices::{RawDevice, RawHub, RawSnapshot};

use crate::codes;
use crate::signing::RequestSigner;
use crate::sync::SnapshotSource;

/// API method names.
pub mod methods {
    pub const AGT_GET_LIST: &str = "AgtGetList";
    pub const EP_GET_ALL: &str = "EpGetAll";
    pub const EP_SET: &str = "EpSet";
    pub const EP_SET_VAR: &str = "EpSetVar";
    pub const EPS_SET: &str = "EpsSet";
}

const PROTOCOL_VERSION: &str = "1.0";

/// How much each device entry of a snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotDegree {
    /// Identity fields only.
    Identity = 0,
    /// Identity plus IO data.
    WithData = 1,
    /// IO data plus heartbeat and signal telemetry.
    #[default]
    WithTelemetry = 2,
    /// Everything, plus self-identity of devices nested under another hub.
    WithSelfIdentity = 3,
}

impl SnapshotDegree {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SnapshotDegree {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SnapshotDegree::Identity),
            1 => Ok(SnapshotDegree::WithData),
            2 => Ok(SnapshotDegree::WithTelemetry),
            3 => Ok(SnapshotDegree::WithSelfIdentity),
            other => Err(Error::config(format!("snapshot degree {} out of range 0..=3", other))),
        }
    }
}

/// Signed `system` block of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub ver: String,
    pub lang: String,
    pub userid: String,
    pub appkey: String,
    pub time: i64,
    pub sign: String,
}

/// Request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: String,
    pub system: SystemBlock,
    pub params: Value,
}

/// Response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    pub code: i64,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// REST client settings.
#[derive(Debug, Clone)]
pub struct CloudClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub transport_retries: u32,
    pub degree: SnapshotDegree,
    pub lang: String,
}

impl CloudClientConfig {
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.api_base_url(),
            timeout: Duration::from_secs(config.api.timeout_secs),
            max_in_flight: config.api.max_in_flight,
            transport_retries: config.api.transport_retries,
            degree: SnapshotDegree::try_from(config.api.snapshot_degree)?,
            lang: "en".to_string(),
        })
    }
}

/// Signed REST client.
pub struct CloudClient {
    http: Client,
    config: CloudClientConfig,
    account: AccountConfig,
    signer: RequestSigner,
    admission: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl CloudClient {
    pub fn new(config: CloudClientConfig, account: AccountConfig, signer: RequestSigner) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            admission: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
            account,
            signer,
            next_id: AtomicU64::new(1),
        })
    }

    /// Client with the default HMAC signer on the wall clock.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let signer = RequestSigner::for_account(&config.account, config.api.signature_tolerance_secs);
        Self::new(CloudClientConfig::from_config(config)?, config.account.clone(), signer)
    }

    pub fn config(&self) -> &CloudClientConfig {
        &self.config
    }

    /// Build a signed envelope.
    pub fn envelope(&self, method: &str, params: Value) -> Result<RequestEnvelope> {
        let stamp = self.signer.stamp(method, &params)?;
        self.signer.check(&stamp)?;
        Ok(RequestEnvelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            system: SystemBlock {
                ver: PROTOCOL_VERSION.to_string(),
                lang: self.config.lang.clone(),
                userid: self.account.user_id.clone(),
                appkey: self.account.app_key.clone(),
                time: stamp.time,
                sign: stamp.sign,
            },
            params,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/api.{}", self.config.base_url.trim_end_matches('/'), method)
    }

    /// One call with call-site retries for transport failures. Non-zero
    /// response codes are returned as-is for the caller to interpret.
    pub async fn call(&self, method: &str, params: Value) -> Result<ResponseEnvelope> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, &params).await {
                Err(e) if e.is_transient() && attempt < self.config.transport_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                    debug!(category = "rest", method, attempt, error = %e, "Retrying call");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<ResponseEnvelope> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| Error::internal("admission closed"))?;
        // Signed after admission so a long wait cannot stale the timestamp.
        let envelope = self.envelope(method, params.clone())?;

        let response = self
            .http
            .post(self.url(method))
            .json(&envelope)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::transport(format!("{} returned HTTP {}", method, status)));
        }
        if !status.is_success() {
            return Err(Error::protocol(
                i64::from(status.as_u16()),
                format!("{} returned HTTP {}", method, status),
            ));
        }
        response.json::<ResponseEnvelope>().await.map_err(map_reqwest_error)
    }

    /// Call and return `data`, turning a non-zero code into an error.
    pub async fn call_data(&self, method: &str, params: Value) -> Result<Value> {
        let response = self.call(method, params).await?;
        match codes::call_error(response.code, response.message_text()) {
            Some(e) => Err(e),
            None => Ok(response.data),
        }
    }

    /// Pull the full hub/device tree.
    pub async fn fetch_snapshot(&self, degree: SnapshotDegree) -> Result<RawSnapshot> {
        let hubs: Vec<RawHub> = from_data(self.call_data(methods::AGT_GET_LIST, json!({})).await?)?;
        let devices: Vec<RawDevice> = from_data(
            self.call_data(methods::EP_GET_ALL, json!({ "degree": degree.as_u8() }))
                .await?,
        )?;
        info!(
            category = "rest",
            hubs = hubs.len(),
            devices = devices.len(),
            degree = degree.as_u8(),
            "Snapshot fetched"
        );
        Ok(RawSnapshot { hubs, devices })
    }

    /// Single-IO write.
    pub async fn ep_set(&self, command: &Command) -> std::result::Result<(), WireError> {
        let response = self.call(methods::EP_SET, ep_set_params(command)).await?;
        into_write_result(&response)
    }

    /// Several IOs of one device in one acknowledged call.
    pub async fn ep_set_var(
        &self,
        hub_id: &str,
        device_id: &str,
        commands: &[Command],
    ) -> std::result::Result<(), WireError> {
        let args: Vec<Value> = commands
            .iter()
            .map(|c| {
                let mut arg = write_arg(c);
                arg.remove("me");
                Value::Object(arg)
            })
            .collect();
        let params = json!({ "agt": hub_id, "me": device_id, "args": args });
        let response = self.call(methods::EP_SET_VAR, params).await?;
        into_write_result(&response)
    }

    /// Many devices of one hub in one call. The result list has one entry per
    /// command.
    pub async fn eps_set(
        &self,
        hub_id: &str,
        commands: &[Command],
        tier: SpeedTier,
    ) -> Vec<std::result::Result<(), WireError>> {
        let params = eps_set_params(hub_id, commands, tier);
        match self.call(methods::EPS_SET, params).await {
            Ok(response) => batch_results(commands.len(), &response),
            Err(e) => {
                warn!(category = "rest", hub_id, commands = commands.len(), error = %e, "Batch write failed");
                let wire = WireError::from(e);
                vec![Err(wire); commands.len()]
            }
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(e.to_string())
    } else if e.is_decode() {
        Error::Serialization(e.to_string())
    } else {
        Error::transport(e.to_string())
    }
}

fn from_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<Vec<T>> {
    match data {
        Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// Write fields of one command, without the hub.
fn write_arg(command: &Command) -> Map<String, Value> {
    let mut arg = Map::new();
    arg.insert("me".to_string(), Value::from(command.device_id.clone()));
    arg.insert("idx".to_string(), Value::from(command.io_key.clone()));
    arg.insert("type".to_string(), Value::from(command.raw_type));
    arg.insert("val".to_string(), Value::from(command.raw_val));
    if let Some(tag) = &command.tag {
        arg.insert("tag".to_string(), Value::from(tag.clone()));
    }
    if command.durable {
        arg.insert("keep".to_string(), Value::from(1));
    }
    arg
}

/// `EpSet` parameters for a command.
pub fn ep_set_params(command: &Command) -> Value {
    let mut params = write_arg(command);
    params.insert("agt".to_string(), Value::from(command.hub_id.clone()));
    Value::Object(params)
}

/// `EpsSet` parameters for a batch on one hub.
pub fn eps_set_params(hub_id: &str, commands: &[Command], tier: SpeedTier) -> Value {
    let args: Vec<Value> = commands.iter().map(|c| Value::Object(write_arg(c))).collect();
    json!({
        "agt": hub_id,
        "args": args,
        "ack": tier == SpeedTier::Normal,
    })
}

fn into_write_result(response: &ResponseEnvelope) -> std::result::Result<(), WireError> {
    match codes::item_error(response.code, response.message_text()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

/// Per-command results of a batch response.
///
/// A protocol-level top-level code fails every item. Otherwise `data` holds
/// one `{code, message}` per command in order; missing items count as lost.
pub fn batch_results(len: usize, response: &ResponseEnvelope) -> Vec<std::result::Result<(), WireError>> {
    if codes::classify(response.code) == codes::CodeClass::Protocol {
        let err = WireError::Protocol {
            code: response.code,
            message: response.message_text(),
        };
        return vec![Err(err); len];
    }

    let items: Vec<BatchItem> = match &response.data {
        Value::Array(_) => serde_json::from_value(response.data.clone()).unwrap_or_default(),
        _ => Vec::new(),
    };
    if items.is_empty() {
        // No per-item detail: the top-level code speaks for every command.
        let result = into_write_result(response);
        return vec![result; len];
    }

    (0..len)
        .map(|i| match items.get(i) {
            Some(item) => match codes::item_error(item.code, item.message.clone().unwrap_or_default()) {
                Some(e) => Err(e),
                None => Ok(()),
            },
            None => Err(WireError::Transport("no result for command".to_string())),
        })
        .collect()
}

#[async_trait]
impl HubWriter for CloudClient {
    async fn write(&self, command: &Command) -> std::result::Result<(), WireError> {
        self.ep_set(command).await
    }

    async fn write_batch(
        &self,
        hub_id: &str,
        commands: &[Command],
        tier: SpeedTier,
    ) -> Vec<std::result::Result<(), WireError>> {
        self.eps_set(hub_id, commands, tier).await
    }
}

#[async_trait]
impl SnapshotSource for CloudClient {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot> {
        CloudClient::fetch_snapshot(self, self.config.degree).await
    }
}
