use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use obs_presence_switch::config::{CaptureMode, CaptureSettings, Config, ConfigFile, DEFAULT_CONFIG_PATH};
use obs_presence_switch::detect::{confirms_presence, CommandDetector};
use obs_presence_switch::frame::{decode_image_data, ConfiguredSource, Frame};
use obs_presence_switch::lifecycle::{shutdown_channel, ConnectionLifecycleManager};
use obs_presence_switch::obs::{current_program_scene, parse_scenes, ObsClient, ObsConnector};
use obs_presence_switch::poll::PollLoop;
use obs_presence_switch::preview::PreviewWriter;
use obs_presence_switch::remote::{Connector, RemoteControl, ScreenshotRequest};
use obs_presence_switch::sync::{SyncRequest, VisibilitySynchronizer};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const CONFIG_HELP: &str = r##"Config JSON (default path: config/obs_config.json):
{
  "obs_host": "localhost",
  "obs_port": 4455,
  "obs_password": "secret",
  "monitor_source_name": "FS Source",
  "show_source_name": "Overlay",
  "hide_source_name": "Idle",
  "detection_scene_name": "Monitor",
  "excluded_scenes": [],
  "face_detection_confidence": 0.7,
  "check_interval": 0.5,
  "standby_check_interval": 5.0,
  "max_consecutive_errors": 5,
  "detector_command": ["python3", "detect_faces.py"],
  "show_preview": false
}

Notes:
- obs_host, obs_port and detector_command are required for `run`; monitor_source_name too with --capture remote.
- the detector reads one PNG frame on stdin and prints scores as JSON ([0.9], {"score": 0.9}, {"detections": [...]}).
- camera capture uses camera_index/camera_path, camera_width/height/fps and an optional camera_command template.
- empty strings count as unset; RUST_LOG overrides the default `info` log filter.
"##;

#[derive(Parser, Debug)]
#[command(
    name = "presence-switch",
    version,
    about = "Show or hide OBS sources across scenes based on presence detection",
    after_long_help = CONFIG_HELP
)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the standby/active presence loop until Ctrl+C
    Run(RunArgs),
    /// Connect once and print versions, scenes and items as JSON, or test
    /// the local camera and the detector
    Check(CheckArgs),
    /// Apply one visibility change to a source across all scenes
    Sync(SyncArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Where frames come from
    #[arg(long, value_enum, default_value_t = CaptureMode::Remote)]
    capture: CaptureMode,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Also fetch one screenshot of monitor_source_name
    #[arg(long, action = ArgAction::SetTrue)]
    screenshot: bool,
    /// Grab one frame from the local camera instead of connecting to OBS
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "screenshot")]
    camera: bool,
    /// Run detector_command on the captured frame (the screenshot unless --camera)
    #[arg(long, action = ArgAction::SetTrue)]
    detect: bool,
}

impl CheckArgs {
    fn wants_screenshot(&self) -> bool {
        !self.camera && (self.screenshot || self.detect)
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("visibility").required(true).args(["show", "hide"])))]
struct SyncArgs {
    /// Source name to toggle
    #[arg(long)]
    source: String,
    /// Make the source visible
    #[arg(long, action = ArgAction::SetTrue)]
    show: bool,
    /// Make the source hidden
    #[arg(long, action = ArgAction::SetTrue)]
    hide: bool,
    /// Leave this scene untouched (repeatable)
    #[arg(long = "exclude")]
    exclude: Vec<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Run(args) => command_run(&cli.config, args).await,
        Commands::Check(args) => command_check(&cli.config, args).await,
        Commands::Sync(args) => command_sync(&cli.config, args).await,
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            ensure_parent_dir(path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
    }
    Ok(())
}

async fn command_run(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = Config::load(config_path, args.capture)
        .with_context(|| format!("invalid config: {}", config_path.display()))?;
    for warning in config.warnings() {
        warn!("{warning}");
    }

    let preview = config.preview.as_ref().map(|path| {
        info!(path = %path.display(), "preview enabled");
        PreviewWriter::new(path)
    });
    let poll = PollLoop::new(
        config.poll.clone(),
        config.targets.clone(),
        ConfiguredSource::from_settings(&config.capture),
        CommandDetector::new(&config.detection),
    )
    .with_preview(preview);
    let mut manager = ConnectionLifecycleManager::new(
        ObsConnector::new(config.connection.clone()),
        config.connection.url(),
        &config.poll,
        config.targets.clone(),
        poll,
    );

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("stop requested");
                trigger.trigger();
            }
            Err(err) => error!(error = %err, "failed to listen for Ctrl+C"),
        }
    });

    manager.run(shutdown).await;
    Ok(())
}

async fn command_check(config_path: &Path, args: CheckArgs) -> Result<()> {
    let raw = ConfigFile::read(config_path)?;
    let detector = if args.detect {
        let settings = raw
            .detection()
            .with_context(|| format!("invalid config: {}", config_path.display()))?;
        Some(CommandDetector::new(&settings))
    } else {
        None
    };

    let (mut payload, frame) = if args.camera {
        check_camera(&raw).await?
    } else {
        check_obs(config_path, &raw, args.wants_screenshot()).await?
    };

    if let Some(detector) = &detector {
        let frame = frame.context("no frame captured for the detector")?;
        payload["detection"] = detection_report(detector, &frame).await?;
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn check_obs(config_path: &Path, raw: &ConfigFile, screenshot: bool) -> Result<(Value, Option<Frame>)> {
    let settings = raw
        .connection()
        .with_context(|| format!("invalid config: {}", config_path.display()))?;
    let url = settings.url();
    let mut client = ObsConnector::new(settings)
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let result = collect_check(&mut client, raw, screenshot).await;
    client.disconnect().await;
    result
}

async fn collect_check(
    client: &mut ObsClient,
    raw: &ConfigFile,
    screenshot: bool,
) -> Result<(Value, Option<Frame>)> {
    let version = client.get_version().await?;
    let scene_list = client.request("GetSceneList", Value::Null).await?;
    let program_scene = current_program_scene(&scene_list);
    let scenes = parse_scenes(&scene_list)?;
    let mut rows = Vec::with_capacity(scenes.len());
    for scene in &scenes {
        let items = client
            .list_scene_items(&scene.name)
            .await
            .with_context(|| format!("failed to list items of scene '{}'", scene.name))?;
        rows.push(json!({ "name": scene.name, "items": items }));
    }

    let (screenshot, frame) = if screenshot {
        let Some(source) = raw
            .monitor_source_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            bail!("a screenshot needs monitor_source_name in the config");
        };
        let request = ScreenshotRequest {
            source_name: source.to_string(),
            format: raw
                .screenshot_format
                .clone()
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| "png".to_string()),
            width: raw.screenshot_width.unwrap_or(640),
            height: raw.screenshot_height.unwrap_or(480),
        };
        let data = client.source_screenshot(&request).await?;
        let frame = Frame::new(decode_image_data(&data)?);
        let summary = json!({
            "source": source,
            "width": frame.image.width(),
            "height": frame.image.height(),
        });
        (summary, Some(frame))
    } else {
        (Value::Null, None)
    };

    let payload = json!({
        "obs_version": version.obs_version,
        "websocket_version": version.websocket_version,
        "current_program_scene": program_scene,
        "scenes": rows,
        "screenshot": screenshot,
    });
    Ok((payload, frame))
}

async fn check_camera(raw: &ConfigFile) -> Result<(Value, Option<Frame>)> {
    let settings = raw.camera()?;
    let requested = match &settings {
        CaptureSettings::Camera {
            device,
            width,
            height,
            fps,
            ..
        } => json!({ "device": device, "width": width, "height": height, "fps": fps }),
        CaptureSettings::Screenshot { .. } => Value::Null,
    };
    let ConfiguredSource::Camera(source) = ConfiguredSource::from_settings(&settings) else {
        bail!("camera settings did not produce a camera source");
    };
    let frame = source
        .grab()
        .await
        .with_context(|| format!("camera capture failed: {}", source.argv().join(" ")))?;

    let payload = json!({
        "camera": {
            "requested": requested,
            "command": source.argv(),
            "width": frame.image.width(),
            "height": frame.image.height(),
        },
    });
    Ok((payload, Some(frame)))
}

async fn detection_report(detector: &CommandDetector, frame: &Frame) -> Result<Value> {
    let scores = detector.scores(frame).await.context("detector failed")?;
    let threshold = detector.threshold();
    Ok(json!({
        "scores": scores,
        "threshold": threshold,
        "present": confirms_presence(&scores, threshold),
    }))
}

async fn command_sync(config_path: &Path, args: SyncArgs) -> Result<()> {
    let raw = ConfigFile::read(config_path)?;
    let settings = raw
        .connection()
        .with_context(|| format!("invalid config: {}", config_path.display()))?;
    let url = settings.url();
    let mut client = ObsConnector::new(settings)
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let request = sync_request(&args);
    let result = VisibilitySynchronizer.synchronize(&mut client, &request).await;
    client.disconnect().await;
    let outcome = result.with_context(|| format!("failed to synchronize '{}'", args.source))?;

    println!(
        "{}",
        serde_json::to_string(&json!({
            "source": request.target_source_name,
            "visible": request.desired_visible,
            "excluded_scenes": request.excluded_scenes,
            "outcome": outcome,
        }))?
    );
    Ok(())
}

fn sync_request(args: &SyncArgs) -> SyncRequest {
    SyncRequest::new(args.source.clone(), args.show && !args.hide)
        .excluding(args.exclude.iter().filter(|s| !s.trim().is_empty()).cloned())
}
