//! Cross-scene visibility synchronization.
//!
//! Scenes and items are fetched fresh on every call. Exclusions only
//! suppress writes; discovery always walks the whole scene list.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, SceneLookupError};
use crate::remote::RemoteControl;

/// One unit of work for [`VisibilitySynchronizer::synchronize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub target_source_name: String,
    pub desired_visible: bool,
    pub excluded_scenes: BTreeSet<String>,
}

impl SyncRequest {
    pub fn new(target: impl Into<String>, desired_visible: bool) -> Self {
        Self {
            target_source_name: target.into(),
            desired_visible,
            excluded_scenes: BTreeSet::new(),
        }
    }

    pub fn excluding<I, S>(mut self, scenes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_scenes
            .extend(scenes.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SyncOutcome {
    /// Successful set-enabled writes, one per matching scene item.
    pub scenes_modified: usize,
    /// At least one matching item was seen in a non-excluded scene.
    pub found: bool,
    /// Scenes skipped because a lookup or write failed inside them.
    #[serde(serialize_with = "serialize_failures")]
    pub failures: Vec<SceneLookupError>,
}

impl SyncOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

fn serialize_failures<S>(failures: &[SceneLookupError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(failures.iter().map(ToString::to_string))
}

/// Applies a visibility change to every placement of a source.
#[derive(Debug, Default, Clone, Copy)]
pub struct VisibilitySynchronizer;

impl VisibilitySynchronizer {
    /// Fails only when the scene list itself cannot be fetched; per-scene
    /// failures are collected into the outcome.
    pub async fn synchronize<C: RemoteControl>(
        &self,
        remote: &mut C,
        request: &SyncRequest,
    ) -> Result<SyncOutcome, ConnectionError> {
        let scenes = remote.list_scenes().await?;
        let name = request.target_source_name.as_str();
        let mut outcome = SyncOutcome::default();

        for scene in &scenes {
            if request.excluded_scenes.contains(&scene.name) {
                debug!(scene = %scene.name, source = name, "skipping excluded scene");
                continue;
            }

            let items = match remote.list_scene_items(&scene.name).await {
                Ok(items) => items,
                Err(source) => {
                    let err = SceneLookupError {
                        scene: scene.name.clone(),
                        source,
                    };
                    warn!(error = %err, source = name, "scene lookup failed; skipping scene");
                    outcome.failures.push(err);
                    continue;
                }
            };

            for item in items.iter().filter(|item| item.source_name == name) {
                outcome.found = true;
                match remote
                    .set_item_enabled(&scene.name, item.item_id, request.desired_visible)
                    .await
                {
                    Ok(()) => {
                        outcome.scenes_modified += 1;
                        debug!(
                            scene = %scene.name,
                            source = name,
                            item_id = item.item_id,
                            visible = request.desired_visible,
                            "scene item updated"
                        );
                    }
                    Err(source) => {
                        let err = SceneLookupError {
                            scene: scene.name.clone(),
                            source,
                        };
                        warn!(error = %err, source = name, item_id = item.item_id, "failed to update scene item");
                        outcome.failures.push(err);
                    }
                }
            }
        }

        let action = if request.desired_visible { "shown" } else { "hidden" };
        if outcome.scenes_modified > 0 {
            if request.excluded_scenes.is_empty() {
                info!(source = name, count = outcome.scenes_modified, "{name} {action}");
            } else {
                let excluded: Vec<&str> = request.excluded_scenes.iter().map(String::as_str).collect();
                info!(
                    source = name,
                    count = outcome.scenes_modified,
                    excluded = %excluded.join(", "),
                    "{name} {action}"
                );
            }
        } else if !outcome.found {
            warn!(source = name, "target not present in current scene graph");
        }

        Ok(outcome)
    }
}
