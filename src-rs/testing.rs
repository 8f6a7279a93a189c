//! In-memory collaborators for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use image::DynamicImage;

use crate::error::{CaptureError, ConnectionError};
use crate::detect::PresenceDetector;
use crate::frame::{Frame, FrameSource};
use crate::lifecycle::ShutdownTrigger;
use crate::remote::{Connector, RemoteControl, Scene, SceneItem, ScreenshotRequest, VersionInfo};

pub type SharedWorld = Arc<Mutex<World>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetVersion,
    ListScenes,
    ListItems(String),
    SetEnabled {
        scene: String,
        source: String,
        enabled: bool,
    },
    Screenshot(String),
    Disconnect,
}

/// A fake mixer: scenes with items, a call log and failure switches.
#[derive(Default)]
pub struct World {
    pub scenes: Vec<(String, Vec<SceneItem>)>,
    pub failing_scenes: HashSet<String>,
    /// Scenes whose item writes are rejected.
    pub rejected_writes: HashSet<String>,
    pub online: bool,
    /// Successful version probes left before the mixer goes offline.
    pub probes_before_offline: Option<usize>,
    pub refuse_connections: usize,
    pub connect_attempts: usize,
    pub stop_at_connect_attempt: Option<usize>,
    pub trigger: Option<ShutdownTrigger>,
    pub screenshot: Option<String>,
    pub log: Vec<Call>,
}

impl World {
    pub fn with_scenes(scenes: &[(&str, &[&str])]) -> SharedWorld {
        let scenes = scenes
            .iter()
            .map(|(scene, sources)| {
                let items = sources
                    .iter()
                    .enumerate()
                    .map(|(idx, source)| SceneItem {
                        scene_name: scene.to_string(),
                        source_name: source.to_string(),
                        item_id: idx as i64 + 1,
                        enabled: false,
                    })
                    .collect();
                (scene.to_string(), items)
            })
            .collect();
        Arc::new(Mutex::new(World {
            scenes,
            online: true,
            ..World::default()
        }))
    }

    pub fn client(world: &SharedWorld) -> MockRemote {
        MockRemote {
            world: Arc::clone(world),
        }
    }

    pub fn enabled(&self, scene: &str, source: &str) -> Vec<bool> {
        self.items(scene)
            .iter()
            .filter(|item| item.source_name == source)
            .map(|item| item.enabled)
            .collect()
    }

    pub fn set_enabled(&mut self, scene: &str, source: &str, enabled: bool) {
        if let Some((_, items)) = self.scenes.iter_mut().find(|(name, _)| name == scene) {
            for item in items.iter_mut().filter(|item| item.source_name == source) {
                item.enabled = enabled;
            }
        }
    }

    /// Successful and attempted writes, as (scene, source, enabled).
    pub fn sets(&self) -> Vec<(String, String, bool)> {
        self.log
            .iter()
            .filter_map(|call| match call {
                Call::SetEnabled {
                    scene,
                    source,
                    enabled,
                } => Some((scene.clone(), source.clone(), *enabled)),
                _ => None,
            })
            .collect()
    }

    fn items(&self, scene: &str) -> &[SceneItem] {
        self.scenes
            .iter()
            .find(|(name, _)| name == scene)
            .map(|(_, items)| items.as_slice())
            .unwrap_or(&[])
    }
}

pub struct MockRemote {
    world: SharedWorld,
}

impl RemoteControl for MockRemote {
    async fn get_version(&mut self) -> Result<VersionInfo, ConnectionError> {
        let mut w = self.world.lock().unwrap();
        w.log.push(Call::GetVersion);
        if let Some(left) = w.probes_before_offline {
            if left == 0 {
                w.online = false;
            } else {
                w.probes_before_offline = Some(left - 1);
            }
        }
        if !w.online {
            return Err(ConnectionError::Closed);
        }
        Ok(VersionInfo {
            obs_version: "30.2.0".to_string(),
            websocket_version: "5.5.0".to_string(),
        })
    }

    async fn list_scenes(&mut self) -> Result<Vec<Scene>, ConnectionError> {
        let mut w = self.world.lock().unwrap();
        w.log.push(Call::ListScenes);
        if !w.online {
            return Err(ConnectionError::Closed);
        }
        Ok(w.scenes
            .iter()
            .map(|(name, _)| Scene { name: name.clone() })
            .collect())
    }

    async fn list_scene_items(&mut self, scene_name: &str) -> Result<Vec<SceneItem>, ConnectionError> {
        let mut w = self.world.lock().unwrap();
        w.log.push(Call::ListItems(scene_name.to_string()));
        if !w.online {
            return Err(ConnectionError::Closed);
        }
        if w.failing_scenes.contains(scene_name) {
            return Err(ConnectionError::Rejected {
                request_type: "GetSceneItemList".to_string(),
                code: 600,
                comment: Some(format!("scene {scene_name} unavailable")),
            });
        }
        Ok(w.items(scene_name).to_vec())
    }

    async fn set_item_enabled(
        &mut self,
        scene_name: &str,
        item_id: i64,
        enabled: bool,
    ) -> Result<(), ConnectionError> {
        let mut w = self.world.lock().unwrap();
        let source = w
            .items(scene_name)
            .iter()
            .find(|item| item.item_id == item_id)
            .map(|item| item.source_name.clone())
            .unwrap_or_default();
        w.log.push(Call::SetEnabled {
            scene: scene_name.to_string(),
            source,
            enabled,
        });
        if !w.online {
            return Err(ConnectionError::Closed);
        }
        if w.rejected_writes.contains(scene_name) {
            return Err(ConnectionError::Rejected {
                request_type: "SetSceneItemEnabled".to_string(),
                code: 600,
                comment: Some(format!("scene {scene_name} is locked")),
            });
        }
        let item = w
            .scenes
            .iter_mut()
            .filter(|(name, _)| name == scene_name)
            .flat_map(|(_, items)| items.iter_mut())
            .find(|item| item.item_id == item_id)
            .ok_or_else(|| ConnectionError::Rejected {
                request_type: "SetSceneItemEnabled".to_string(),
                code: 600,
                comment: None,
            })?;
        item.enabled = enabled;
        Ok(())
    }

    async fn source_screenshot(
        &mut self,
        request: &ScreenshotRequest,
    ) -> Result<String, ConnectionError> {
        let mut w = self.world.lock().unwrap();
        w.log.push(Call::Screenshot(request.source_name.clone()));
        if !w.online {
            return Err(ConnectionError::Closed);
        }
        w.screenshot.clone().ok_or_else(|| ConnectionError::Rejected {
            request_type: "GetSourceScreenshot".to_string(),
            code: 600,
            comment: None,
        })
    }

    async fn disconnect(&mut self) {
        self.world.lock().unwrap().log.push(Call::Disconnect);
    }
}

pub struct MockConnector {
    pub world: SharedWorld,
}

impl Connector for MockConnector {
    type Client = MockRemote;

    async fn connect(&self) -> Result<MockRemote, ConnectionError> {
        let mut w = self.world.lock().unwrap();
        w.connect_attempts += 1;
        if Some(w.connect_attempts) == w.stop_at_connect_attempt {
            if let Some(trigger) = w.trigger.as_ref() {
                trigger.trigger();
            }
        }
        if w.refuse_connections > 0 {
            w.refuse_connections -= 1;
            return Err(ConnectionError::Connect {
                url: "ws://mock:4455".to_string(),
                message: "connection refused".to_string(),
            });
        }
        w.online = true;
        Ok(MockRemote {
            world: Arc::clone(&self.world),
        })
    }
}

/// Yields scripted capture results, then plain frames forever.
#[derive(Default)]
pub struct ScriptedSource {
    pub script: VecDeque<bool>,
    pub captures: usize,
}

impl ScriptedSource {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            script: std::iter::repeat(false).take(failures).collect(),
            captures: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    async fn capture<C: RemoteControl>(&mut self, _remote: &mut C) -> Result<Frame, CaptureError> {
        self.captures += 1;
        if self.script.pop_front().unwrap_or(true) {
            Ok(Frame::new(DynamicImage::new_rgb8(2, 2)))
        } else {
            Err(CaptureError::Program("scripted capture failure".to_string()))
        }
    }
}

/// Replays a fixed detector output sequence, then keeps the last value.
pub struct ScriptedDetector {
    script: VecDeque<bool>,
    last: bool,
}

impl ScriptedDetector {
    pub fn new(script: &[bool]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            last: false,
        }
    }
}

impl PresenceDetector for ScriptedDetector {
    async fn evaluate(&mut self, _frame: &Frame) -> bool {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last
    }
}
