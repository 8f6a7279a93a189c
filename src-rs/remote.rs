//! Remote control surface of the mixer.
//!
//! The core only talks to these traits; [`crate::obs`] provides the
//! websocket-backed implementation and tests use an in-memory one.

#![allow(async_fn_in_trait)]

use serde::Serialize;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scene {
    pub name: String,
}

/// One placement of a source inside a scene. `item_id` is scene-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneItem {
    pub scene_name: String,
    pub source_name: String,
    pub item_id: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub obs_version: String,
    pub websocket_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotRequest {
    pub source_name: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
}

/// RPC-like client over an established control connection.
pub trait RemoteControl {
    /// Liveness probe.
    async fn get_version(&mut self) -> Result<VersionInfo, ConnectionError>;

    async fn list_scenes(&mut self) -> Result<Vec<Scene>, ConnectionError>;

    async fn list_scene_items(&mut self, scene_name: &str) -> Result<Vec<SceneItem>, ConnectionError>;

    async fn set_item_enabled(
        &mut self,
        scene_name: &str,
        item_id: i64,
        enabled: bool,
    ) -> Result<(), ConnectionError>;

    /// Encoded image, possibly as a `data:` URL.
    async fn source_screenshot(
        &mut self,
        request: &ScreenshotRequest,
    ) -> Result<String, ConnectionError>;

    /// Releases the connection. Never fails; errors on close are dropped.
    async fn disconnect(&mut self);
}

/// Opens fresh control connections for the lifecycle manager.
pub trait Connector {
    type Client: RemoteControl;

    async fn connect(&self) -> Result<Self::Client, ConnectionError>;
}
