//! obs-websocket (protocol v5) client.
//!
//! Only the JSON message layer lives here: Hello / Identify / Identified and
//! Request / RequestResponse. Websocket framing is tungstenite's job.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::config::ConnectionSettings;
use crate::error::ConnectionError;
use crate::remote::{Connector, RemoteControl, Scene, SceneItem, ScreenshotRequest, VersionInfo};

const RPC_VERSION: u64 = 1;

const OP_HELLO: u64 = 0;
const OP_IDENTIFY: u64 = 1;
const OP_IDENTIFIED: u64 = 2;
const OP_REQUEST: u64 = 6;
const OP_REQUEST_RESPONSE: u64 = 7;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct Envelope {
    op: u64,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    #[serde(default)]
    obs_web_socket_version: Option<String>,
    #[serde(default)]
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponse {
    request_type: String,
    request_id: String,
    request_status: RequestStatus,
    #[serde(default)]
    response_data: Value,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: i64,
    #[serde(default)]
    comment: Option<String>,
}

/// Builds the Identify `authentication` string from the Hello challenge.
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    BASE64.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// Connects with the configured host, port and password.
pub struct ObsConnector {
    settings: ConnectionSettings,
}

impl ObsConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl Connector for ObsConnector {
    type Client = ObsClient;

    async fn connect(&self) -> Result<ObsClient, ConnectionError> {
        let limit = self.settings.request_timeout;
        tokio::time::timeout(limit, ObsClient::connect(&self.settings))
            .await
            .map_err(|_| ConnectionError::timeout("connect", limit))?
    }
}

pub struct ObsClient {
    ws: Socket,
    next_id: u64,
    request_timeout: Duration,
}

impl ObsClient {
    /// Opens the socket and completes the identification handshake.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, ConnectionError> {
        let url = settings.url();
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectionError::Connect {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let hello_env = read_envelope(&mut ws).await?;
        if hello_env.op != OP_HELLO {
            return Err(ConnectionError::Handshake(format!(
                "expected Hello (op {OP_HELLO}), got op {}",
                hello_env.op
            )));
        }
        let hello: Hello = serde_json::from_value(hello_env.d)
            .map_err(|err| ConnectionError::Handshake(format!("malformed Hello: {err}")))?;

        let mut identify = json!({
            "rpcVersion": RPC_VERSION,
            // no event subscriptions: only request responses come back
            "eventSubscriptions": 0,
        });
        if let Some(auth) = hello.authentication.as_ref() {
            let password = settings.password.as_deref().ok_or_else(|| {
                ConnectionError::Handshake("server requires a password but none is configured".to_string())
            })?;
            identify["authentication"] = json!(auth_response(password, &auth.salt, &auth.challenge));
        }
        send_json(&mut ws, &json!({ "op": OP_IDENTIFY, "d": identify })).await?;

        let identified = read_envelope(&mut ws).await?;
        if identified.op != OP_IDENTIFIED {
            return Err(ConnectionError::Handshake(format!(
                "identification rejected (op {})",
                identified.op
            )));
        }

        debug!(
            url = %url,
            websocket_version = hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
            "identified"
        );

        Ok(Self {
            ws,
            next_id: 1,
            request_timeout: settings.request_timeout,
        })
    }

    /// Sends one request and waits for its response, bounded by the per-call
    /// timeout.
    pub async fn request(&mut self, request_type: &str, data: Value) -> Result<Value, ConnectionError> {
        let limit = self.request_timeout;
        tokio::time::timeout(limit, self.request_inner(request_type, data))
            .await
            .map_err(|_| ConnectionError::timeout(request_type, limit))?
    }

    async fn request_inner(&mut self, request_type: &str, data: Value) -> Result<Value, ConnectionError> {
        let request_id = self.next_id.to_string();
        self.next_id += 1;

        let mut payload = json!({
            "requestType": request_type,
            "requestId": request_id,
        });
        if !data.is_null() {
            payload["requestData"] = data;
        }
        send_json(&mut self.ws, &json!({ "op": OP_REQUEST, "d": payload })).await?;

        loop {
            let envelope = read_envelope(&mut self.ws).await?;
            if envelope.op != OP_REQUEST_RESPONSE {
                debug!(op = envelope.op, "ignoring unsolicited message");
                continue;
            }
            let response: RequestResponse = serde_json::from_value(envelope.d)
                .map_err(|err| ConnectionError::Protocol(format!("malformed RequestResponse: {err}")))?;
            if response.request_id != request_id {
                debug!(request_id = %response.request_id, "ignoring stale response");
                continue;
            }
            if !response.request_status.result {
                return Err(ConnectionError::Rejected {
                    request_type: response.request_type,
                    code: response.request_status.code,
                    comment: response.request_status.comment,
                });
            }
            return Ok(response.response_data);
        }
    }
}

impl RemoteControl for ObsClient {
    async fn get_version(&mut self) -> Result<VersionInfo, ConnectionError> {
        let data = self.request("GetVersion", Value::Null).await?;
        parse_version(&data)
    }

    async fn list_scenes(&mut self) -> Result<Vec<Scene>, ConnectionError> {
        let data = self.request("GetSceneList", Value::Null).await?;
        parse_scenes(&data)
    }

    async fn list_scene_items(&mut self, scene_name: &str) -> Result<Vec<SceneItem>, ConnectionError> {
        let data = self
            .request("GetSceneItemList", json!({ "sceneName": scene_name }))
            .await?;
        parse_scene_items(scene_name, &data)
    }

    async fn set_item_enabled(
        &mut self,
        scene_name: &str,
        item_id: i64,
        enabled: bool,
    ) -> Result<(), ConnectionError> {
        self.request(
            "SetSceneItemEnabled",
            json!({
                "sceneName": scene_name,
                "sceneItemId": item_id,
                "sceneItemEnabled": enabled,
            }),
        )
        .await?;
        Ok(())
    }

    async fn source_screenshot(
        &mut self,
        request: &ScreenshotRequest,
    ) -> Result<String, ConnectionError> {
        let data = self
            .request(
                "GetSourceScreenshot",
                json!({
                    "sourceName": request.source_name,
                    "imageFormat": request.format,
                    "imageWidth": request.width,
                    "imageHeight": request.height,
                }),
            )
            .await?;
        data.get("imageData")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectionError::Protocol("GetSourceScreenshot without imageData".to_string()))
    }

    async fn disconnect(&mut self) {
        let _ = self.ws.close(None).await;
        info!("disconnected from OBS");
    }
}

async fn send_json(ws: &mut Socket, value: &Value) -> Result<(), ConnectionError> {
    let raw = serde_json::to_string(value)
        .map_err(|err| ConnectionError::Protocol(format!("failed to serialize message: {err}")))?;
    ws.send(Message::Text(raw.into()))
        .await
        .map_err(|err| ConnectionError::Transport(err.to_string()))
}

async fn read_envelope(ws: &mut Socket) -> Result<Envelope, ConnectionError> {
    loop {
        let message = match ws.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(ConnectionError::Transport(err.to_string())),
            None => return Err(ConnectionError::Closed),
        };
        let raw = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Message::Close(_) => return Err(ConnectionError::Closed),
            _ => continue,
        };
        return parse_envelope(&raw);
    }
}

fn parse_envelope(raw: &str) -> Result<Envelope, ConnectionError> {
    serde_json::from_str(raw)
        .map_err(|err| ConnectionError::Protocol(format!("invalid message: {err}")))
}

fn parse_version(data: &Value) -> Result<VersionInfo, ConnectionError> {
    let field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectionError::Protocol(format!("GetVersion without {key}")))
    };
    Ok(VersionInfo {
        obs_version: field("obsVersion")?,
        websocket_version: field("obsWebSocketVersion")?,
    })
}

/// Scene names from a GetSceneList payload, in the order OBS reports them.
pub fn parse_scenes(data: &Value) -> Result<Vec<Scene>, ConnectionError> {
    let scenes = data
        .get("scenes")
        .and_then(Value::as_array)
        .ok_or_else(|| ConnectionError::Protocol("GetSceneList without scenes".to_string()))?;
    Ok(scenes
        .iter()
        .filter_map(|scene| scene.get("sceneName").and_then(Value::as_str))
        .map(|name| Scene {
            name: name.to_string(),
        })
        .collect())
}

fn parse_scene_items(scene_name: &str, data: &Value) -> Result<Vec<SceneItem>, ConnectionError> {
    let items = data
        .get("sceneItems")
        .and_then(Value::as_array)
        .ok_or_else(|| ConnectionError::Protocol("GetSceneItemList without sceneItems".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            Some(SceneItem {
                scene_name: scene_name.to_string(),
                source_name: item.get("sourceName")?.as_str()?.to_string(),
                item_id: item.get("sceneItemId")?.as_i64()?,
                enabled: item
                    .get("sceneItemEnabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            })
        })
        .collect())
}

/// Current program scene from a GetSceneList payload.
pub fn current_program_scene(data: &Value) -> Option<String> {
    data.get("currentProgramSceneName")
        .and_then(Value::as_str)
        .map(str::to_string)
}
