mod auth;
mod config;
mod pipeline;
mod render;
mod types;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select, tick, unbounded};
use indicatif::{ProgressBar, ProgressStyle};

use auth::{AuthClient, MONITOR_ROLES, Role, SessionStore};
use config::MonitorConfig;
use pipeline::{CaptureLoop, HttpRecognizer, LoopSettings, MediaDevices, MonitorEvent};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file (defaults to $ATTENDANCE_CONFIG when set).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in against the attendance backend and store the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "ATTENDANCE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, value_enum)]
        role: Role,
    },
    /// Forget the stored session.
    Logout,
    /// Show the signed-in profile.
    Whoami,
    /// List capture devices.
    Cameras,
    /// Watch the classroom camera and report recognized students.
    Monitor {
        /// Capture device index, overrides the configured one.
        #[arg(long)]
        camera: Option<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = MonitorConfig::load(args.config.as_deref())?;
    let store = SessionStore::new(cfg.session_file.clone());

    match args.command {
        Command::Login {
            email,
            password,
            role,
        } => {
            let client = AuthClient::new(&cfg.api.base_url, cfg.api.request_timeout)?;
            let profile = client.login(&store, &email, &password, role)?;
            println!("Signed in as {} <{}> ({})", profile.name, profile.email, profile.role);
        }
        Command::Logout => {
            store.clear()?;
            println!("Signed out");
        }
        Command::Whoami => match store.restore()? {
            Some(profile) => {
                println!("{} <{}> ({})", profile.name, profile.email, profile.role);
                if let Some(student_id) = profile.student_id {
                    println!("student id: {student_id}");
                }
            }
            None => println!("Not signed in (no session in {})", store.path().display()),
        },
        Command::Cameras => list_cameras()?,
        Command::Monitor { camera } => {
            if let Some(index) = camera {
                cfg.camera.index = index;
            }
            run_monitor(&cfg, store)?;
        }
    }

    Ok(())
}

#[cfg(feature = "camera-nokhwa")]
fn platform_devices() -> Result<Arc<dyn MediaDevices>> {
    Ok(Arc::new(pipeline::NokhwaDevices::new()))
}

#[cfg(not(feature = "camera-nokhwa"))]
fn platform_devices() -> Result<Arc<dyn MediaDevices>> {
    bail!("built without camera support; enable the `camera-nokhwa` feature")
}

#[cfg(feature = "camera-nokhwa")]
fn list_cameras() -> Result<()> {
    let cameras = pipeline::available_cameras().context("failed to enumerate cameras")?;
    if cameras.is_empty() {
        println!("No camera found");
    }
    for camera in cameras {
        println!("{}: {}", camera.index, camera.label);
    }
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn list_cameras() -> Result<()> {
    bail!("built without camera support; enable the `camera-nokhwa` feature")
}

fn loading_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message("Loading camera...");
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn run_monitor(cfg: &MonitorConfig, store: SessionStore) -> Result<()> {
    let profile = store
        .restore()?
        .ok_or_else(|| anyhow!("not signed in; run `attendance-monitor login` first"))?;
    if !profile.has_role(MONITOR_ROLES) {
        bail!("{} accounts cannot run the camera monitor", profile.role);
    }

    let devices = platform_devices()?;
    let endpoint = HttpRecognizer::new(&cfg.api.base_url, cfg.api.request_timeout)?;
    log::info!("submitting frames to {}", endpoint.url());

    let (event_tx, event_rx) = unbounded();
    let mut capture = CaptureLoop::new(
        devices,
        Arc::new(endpoint),
        Arc::new(store),
        LoopSettings::from_config(cfg),
    )
    .with_events(event_tx);

    let spinner = loading_spinner();
    let started = capture.start();
    spinner.finish_and_clear();
    if let Err(err) = started {
        eprintln!("Camera error: {}", err.user_message());
        return Err(err.into());
    }

    let (shutdown_tx, shutdown_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    println!(
        "● Live on {}. Press Ctrl-C to stop.",
        capture.stream_label().unwrap_or("camera")
    );

    let threshold = cfg.recognition.low_liveness_threshold;
    let health = tick(HEALTH_CHECK_INTERVAL);
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(event_rx) -> event => match event {
                Ok(MonitorEvent::SnapshotUpdated) => {
                    match render::render_text(&capture.snapshot(), threshold) {
                        Some(text) => print!("{text}"),
                        None => println!("(no faces detected)"),
                    }
                }
                Ok(MonitorEvent::UnknownPersons { count }) => {
                    eprintln!("⚠️ {count} unknown person(s) detected!");
                }
                Ok(_) => {}
                Err(_) => break,
            },
            recv(health) -> _ => {
                if let Err(err) = capture.check_health() {
                    eprintln!("Camera error: {}", err.user_message());
                    return Err(err.into());
                }
            }
        }
    }

    capture.stop();
    let stats = capture.stats();
    log::info!(
        "monitoring stopped: {} ticks, {} requests, {} applied, {} dropped, {} stale",
        stats.ticks_fired,
        stats.requests_sent,
        stats.responses_applied,
        stats.ticks_dropped,
        stats.stale_responses
    );
    Ok(())
}
