//! Presence detection capability.
//!
//! The vision model itself is an external program: it receives the frame as
//! PNG on stdin and prints detection confidences as JSON on stdout.

#![allow(async_fn_in_trait)]

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::config::DetectionSettings;
use crate::error::DetectError;
use crate::frame::Frame;

pub trait PresenceDetector {
    /// True if presence is confirmed in this frame.
    async fn evaluate(&mut self, frame: &Frame) -> bool;
}

/// Runs the configured detector program once per frame.
pub struct CommandDetector {
    argv: Vec<String>,
    threshold: f64,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            argv: settings.command.clone(),
            threshold: settings.confidence,
            timeout: settings.timeout,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn scores(&self, frame: &Frame) -> Result<Vec<f64>, DetectError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| DetectError::Program("empty detector command".to_string()))?;
        let png = frame
            .encode_png()
            .map_err(|err| DetectError::Encode(err.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .env("PRESENCE_MIN_CONFIDENCE", self.threshold.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| DetectError::Program(format!("failed to start {program}: {err}")))?;

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&png)
                    .await
                    .map_err(|err| DetectError::Program(format!("failed to write frame: {err}")))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|err| DetectError::Program(err.to_string()))
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DetectError::Timeout(self.timeout.as_secs_f64()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DetectError::Program(format!(
                "{program} exited with {}: {stderr}",
                output.status.code().unwrap_or(1)
            )));
        }
        parse_scores(&String::from_utf8_lossy(&output.stdout))
    }
}

impl PresenceDetector for CommandDetector {
    async fn evaluate(&mut self, frame: &Frame) -> bool {
        match self.scores(frame).await {
            Ok(scores) => {
                debug!(?scores, threshold = self.threshold, "detector scores");
                confirms_presence(&scores, self.threshold)
            }
            Err(err) => {
                error!(error = %err, "presence detection failed");
                false
            }
        }
    }
}

/// Presence needs at least one confidence strictly above the threshold.
pub fn confirms_presence(scores: &[f64], threshold: f64) -> bool {
    scores.iter().any(|score| *score > threshold)
}

/// Accepts `[0.9, ..]`, `{"scores": [..]}`, `{"score": 0.9}` or
/// `{"detections": [{"score": 0.9} | 0.9, ..]}`.
pub fn parse_scores(raw: &str) -> Result<Vec<f64>, DetectError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|err| DetectError::Output(err.to_string()))?;

    match &value {
        Value::Array(items) => collect_scores(items),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("detections").or_else(|| map.get("scores")) {
                collect_scores(items)
            } else if let Some(score) = map.get("score").and_then(Value::as_f64) {
                Ok(vec![score])
            } else {
                Err(DetectError::Output(format!("no scores in {}", truncate(trimmed))))
            }
        }
        _ => Err(DetectError::Output(truncate(trimmed))),
    }
}

fn collect_scores(items: &[Value]) -> Result<Vec<f64>, DetectError> {
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .or_else(|| item.get("score").and_then(Value::as_f64))
                .ok_or_else(|| DetectError::Output(format!("not a score: {item}")))
        })
        .collect()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= 120 {
        return text.to_string();
    }
    text.chars().take(120).collect::<String>() + "..."
}
