#![forbid(unsafe_code)]

//! Gateway entry point: loads configuration, installs logging and serves the
//! HTTP API until Ctrl+C.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use newtube_gateway::{
    admission::SysinfoProbe,
    config::{ConfigOverrides, resolve_config},
    security::{check_cookie_file, ensure_not_root},
    server::{AppState, router},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info,newtube_gateway=info";

#[derive(Parser, Debug)]
#[command(name = "newtube-gateway")]
#[command(about = "Fetches videos through yt-dlp and streams them to HTTP clients")]
struct Args {
    /// Address to listen on (overrides GATEWAY_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides GATEWAY_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Env file with additional settings
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// yt-dlp executable (overrides YT_DLP_PATH)
    #[arg(long = "yt-dlp", value_name = "PATH")]
    yt_dlp: Option<PathBuf>,

    /// ffmpeg executable used for MP3 encoding (overrides FFMPEG_PATH)
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<PathBuf>,

    /// Netscape cookie file handed to yt-dlp (overrides GATEWAY_COOKIES_FILE)
    #[arg(long, value_name = "PATH")]
    cookies: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    ensure_not_root("newtube-gateway")?;

    let config = resolve_config(ConfigOverrides {
        host: args.host,
        port: args.port,
        env_path: args.env_file,
        yt_dlp: args.yt_dlp,
        ffmpeg: args.ffmpeg,
        cookies_file: args.cookies,
    })
    .context("loading gateway configuration")?;
    check_cookie_file(config.resolver.cookies_file.as_deref());

    let addr = config.bind_addr();
    info!(
        downloads = config.queue.max_concurrent_downloads,
        lookups = config.queue.max_concurrent_metadata,
        yt_dlp = %config.resolver.program.display(),
        "starting gateway"
    );

    let state = AppState::new(config, Box::new(SysinfoProbe::default()));
    let tasks = state.start();
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("gateway listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running gateway server")?;

    state.shutdown();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(%err, "background task ended abnormally");
        }
    }
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
}
