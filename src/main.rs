// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! camwatch — multi-camera capture supervisor
//!
//! Usage:
//!   camwatch run              # supervise all cameras, serve the control API
//!   camwatch probe            # check every configured camera and exit
//!   camwatch clean            # one-shot grooming of old recordings

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camwatch::api::{self, AppState};
use camwatch::cameras::{redact_credentials, CameraRegistry};
use camwatch::cleanup;
use camwatch::config::{self, Settings};
use camwatch::encoder::EncoderDriver;
use camwatch::fsutil;
use camwatch::recording::RecordingSupervisor;
use camwatch::resources::ResourceMonitor;
use camwatch::streaming::StreamingSupervisor;

#[derive(Parser)]
#[command(name = "camwatch", about = "Multi-camera capture supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise streaming for all enabled cameras and serve the control API.
    Run,
    /// Probe every configured camera's RTSP source and exit.
    Probe,
    /// Groom old and undersized recordings, then exit.
    Clean,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run => run_supervisor().await,
        Command::Probe => run_probe().await,
        Command::Clean => run_clean(),
    };
    if let Err(e) = result {
        error!(error = format!("{e:#}"), "camwatch failed");
        std::process::exit(1);
    }
}

fn load_settings() -> Result<Arc<Settings>> {
    let settings = Settings::from_env().context("loading settings from environment")?;
    Ok(Arc::new(settings))
}

async fn run_supervisor() -> Result<()> {
    let settings = load_settings()?;
    startup_checks(&settings).context("startup checks")?;

    let registry = Arc::new(CameraRegistry::new(settings.config_path.clone()));
    let cameras = registry.cameras().context("loading camera list")?;
    info!(
        cameras = cameras.len(),
        enabled = cameras.iter().filter(|c| c.enabled).count(),
        base_path = %settings.base_path.display(),
        max_streams = settings.max_concurrent_streams,
        "Starting camwatch"
    );

    let encoder = Arc::new(EncoderDriver::new(settings.clone()));

    // Cold boot: no encoder from a previous run may keep writing into the
    // directories we are about to supervise.
    let killed = encoder.kill_all(None);
    if killed > 0 {
        info!(killed, "Removed leftover encoder processes");
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }
    cleanup::cold_boot(&settings);

    let resources = ResourceMonitor::new(settings.clone());
    let streaming = StreamingSupervisor::new(
        settings.clone(),
        registry.clone(),
        encoder.clone(),
        resources.clone(),
    );
    let recording =
        RecordingSupervisor::new(settings.clone(), registry.clone(), encoder.clone());

    streaming.clone().spawn_workers();
    recording.clone().spawn_monitors();

    {
        let resources = resources.clone();
        let streaming = streaming.clone();
        tokio::spawn(async move { resources.run(streaming).await });
    }
    {
        let settings = settings.clone();
        let streaming = streaming.clone();
        tokio::spawn(async move { cleanup::run(settings, streaming).await });
    }

    let state = Arc::new(AppState {
        settings: settings.clone(),
        registry: registry.clone(),
        streaming: streaming.clone(),
        recording: recording.clone(),
        resources: resources.clone(),
    });
    let port = settings.api_port;
    tokio::spawn(async move {
        api::start_server(state, port).await;
    });

    // Streaming is automatic; recordings wait for operator commands.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    for camera in cameras.iter().filter(|c| c.enabled) {
        streaming.get_or_start(camera);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for CTRL+C")?;
    info!("Received CTRL+C, shutting down");

    recording.stop_all().await;
    streaming.stop_all().await;
    encoder.kill_all(None);
    info!("Shutdown complete");
    Ok(())
}

fn startup_checks(settings: &Settings) -> Result<()> {
    config::check_config_file(&settings.config_path).context("camera list file")?;
    config::check_encoder(&settings.ffmpeg_path).context("encoder binary")?;
    for dir in [
        &settings.base_path,
        &settings.tmp_path,
        &settings.record_path,
        &settings.backup_path,
        &settings.log_path,
    ] {
        fsutil::ensure_directory(dir)
            .with_context(|| format!("preparing directory {}", dir.display()))?;
    }
    Ok(())
}

async fn run_probe() -> Result<()> {
    let settings = load_settings()?;
    let registry = CameraRegistry::new(settings.config_path.clone());
    let cameras = registry.cameras().context("loading camera list")?;

    let encoder = EncoderDriver::new(settings.clone());
    let mut unreachable = 0;
    for camera in &cameras {
        if !camera.enabled {
            println!("{:<12} disabled", camera.id);
            continue;
        }
        match encoder
            .probe_rtsp(&camera.rtsp_url, settings.rtsp_timeout)
            .await
        {
            Ok(()) => println!(
                "{:<12} ok        {}",
                camera.id,
                redact_credentials(&camera.rtsp_url)
            ),
            Err(reason) => {
                unreachable += 1;
                println!("{:<12} FAILED    {reason}", camera.id);
            }
        }
    }
    if unreachable > 0 {
        bail!("{unreachable} camera(s) unreachable");
    }
    Ok(())
}

fn run_clean() -> Result<()> {
    let settings = load_settings()?;
    let groomed = cleanup::groom_recordings(&settings);
    let pruned = fsutil::clean_small_recordings(&settings.record_path, 1024 * 1024);
    println!("Deleted {} old and {} undersized recordings", groomed, pruned);
    Ok(())
}
