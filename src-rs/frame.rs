//! Frame acquisition: remote source screenshots or a local capture device.

#![allow(async_fn_in_trait)]

use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::CaptureSettings;
use crate::error::CaptureError;
use crate::remote::{RemoteControl, ScreenshotRequest};

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = std::io::Cursor::new(Vec::new());
        self.image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Produces the next frame. Failures are transient and counted by the poll
/// loop. The control connection is passed in for sources that need it.
pub trait FrameSource {
    async fn capture<C: RemoteControl>(&mut self, remote: &mut C) -> Result<Frame, CaptureError>;
}

/// Decodes a screenshot payload, with or without a `data:` URL prefix.
pub fn decode_image_data(data: &str) -> Result<DynamicImage, CaptureError> {
    let encoded = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| CaptureError::Decode("data URL without payload".to_string()))?,
        None => data,
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| CaptureError::Decode(format!("base64: {err}")))?;
    image::load_from_memory(&bytes).map_err(|err| CaptureError::Decode(err.to_string()))
}

/// Screenshots of the monitored source over the control connection.
pub struct ScreenshotSource {
    request: ScreenshotRequest,
}

impl ScreenshotSource {
    pub fn new(request: ScreenshotRequest) -> Self {
        Self { request }
    }
}

impl FrameSource for ScreenshotSource {
    async fn capture<C: RemoteControl>(&mut self, remote: &mut C) -> Result<Frame, CaptureError> {
        let data = remote.source_screenshot(&self.request).await?;
        let image = decode_image_data(&data)?;
        Ok(Frame::new(image))
    }
}

/// Reads one still image per capture from a local device through an external
/// program writing the encoded image to stdout.
pub struct CameraSource {
    argv: Vec<String>,
    timeout: Duration,
}

impl CameraSource {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    pub fn from_settings(
        device: &str,
        width: u32,
        height: u32,
        fps: u32,
        command: Option<&[String]>,
        timeout: Duration,
    ) -> Self {
        let template: Vec<String> = match command {
            Some(argv) => argv.to_vec(),
            None => default_camera_command(),
        };
        let argv = template
            .iter()
            .map(|arg| {
                arg.replace("{device}", device)
                    .replace("{width}", &width.to_string())
                    .replace("{height}", &height.to_string())
                    .replace("{fps}", &fps.to_string())
            })
            .collect::<Vec<_>>();
        info!(device, width, height, fps, program = %argv.first().map(String::as_str).unwrap_or(""), "camera capture configured");
        Self::new(argv, timeout)
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

fn default_camera_command() -> Vec<String> {
    [
        "ffmpeg",
        "-loglevel",
        "error",
        "-f",
        "v4l2",
        "-video_size",
        "{width}x{height}",
        "-framerate",
        "{fps}",
        "-i",
        "{device}",
        "-frames:v",
        "1",
        "-f",
        "image2pipe",
        "-vcodec",
        "png",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl FrameSource for CameraSource {
    async fn capture<C: RemoteControl>(&mut self, _remote: &mut C) -> Result<Frame, CaptureError> {
        self.grab().await
    }
}

impl CameraSource {
    /// One still from the device; needs no control connection.
    pub async fn grab(&self) -> Result<Frame, CaptureError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| CaptureError::Program("empty capture command".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CaptureError::Program(format!("failed to start {program}: {err}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout.as_secs_f64()))?
            .map_err(|err| CaptureError::Program(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CaptureError::Program(format!(
                "{program} exited with {}: {stderr}",
                output.status.code().unwrap_or(1)
            )));
        }
        debug!(bytes = output.stdout.len(), "camera frame read");
        let image =
            image::load_from_memory(&output.stdout).map_err(|err| CaptureError::Decode(err.to_string()))?;
        Ok(Frame::new(image))
    }
}

/// Capture strategy picked from configuration.
pub enum ConfiguredSource {
    Screenshot(ScreenshotSource),
    Camera(CameraSource),
}

impl ConfiguredSource {
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        match settings {
            CaptureSettings::Screenshot {
                source,
                format,
                width,
                height,
            } => ConfiguredSource::Screenshot(ScreenshotSource::new(ScreenshotRequest {
                source_name: source.clone(),
                format: format.clone(),
                width: *width,
                height: *height,
            })),
            CaptureSettings::Camera {
                device,
                width,
                height,
                fps,
                command,
                timeout,
            } => ConfiguredSource::Camera(CameraSource::from_settings(
                device,
                *width,
                *height,
                *fps,
                command.as_deref(),
                *timeout,
            )),
        }
    }
}

impl FrameSource for ConfiguredSource {
    async fn capture<C: RemoteControl>(&mut self, remote: &mut C) -> Result<Frame, CaptureError> {
        match self {
            ConfiguredSource::Screenshot(source) => source.capture(remote).await,
            ConfiguredSource::Camera(source) => source.capture(remote).await,
        }
    }
}
