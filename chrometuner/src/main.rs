//! chrometuner: virtual network tuner backed by a capturing browser.
//!
//! DVR software discovers it as an HDHomeRun-style tuner, reads the channel
//! lineup, and requests streams; each stream is a browser tab navigated to a
//! channel, captured, and piped back over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

mod browser;
mod config;
mod logging;
mod server;
mod tuner;
mod web;

use browser::{BrowserManager, PagePool};
use config::ConfigFile;
use server::CapturePipeline;
use tuner::AdmissionController;
use web::AppState;

/// chrometuner - browser-capture virtual tuner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Address to serve the tuner API and streams on
    #[arg(short, long)]
    listen: Option<String>,

    /// Address for the secondary discovery listener
    #[arg(long)]
    discovery_listen: Option<String>,

    /// Disable the secondary discovery listener
    #[arg(long)]
    no_discovery: bool,

    /// External base URL advertised to clients
    #[arg(long)]
    base_url: Option<String>,

    /// Maximum concurrent streams (advertised tuner count)
    #[arg(short = 'n', long)]
    max_streams: Option<usize>,

    /// Browser executable to launch
    #[arg(long)]
    browser: Option<PathBuf>,

    /// Browser profile directory
    #[arg(long)]
    profile_dir: Option<PathBuf>,

    /// Run the browser headless
    #[arg(long)]
    headless: bool,

    /// Output format: mpegts or native
    #[arg(short, long)]
    output: Option<String>,

    /// ffmpeg executable used for MPEG-TS output
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

impl Args {
    /// Command line takes precedence over the config file.
    fn apply_to(self, config: &mut ConfigFile) {
        let path_string = |p: PathBuf| p.to_string_lossy().into_owned();

        if let Some(listen) = self.listen {
            config.server.listen = Some(listen);
        }
        if let Some(listen) = self.discovery_listen {
            config.server.discovery_listen = Some(listen);
        }
        if self.no_discovery {
            config.server.enable_discovery = Some(false);
        }
        if let Some(base_url) = self.base_url {
            config.server.base_url = Some(base_url);
        }
        if let Some(max_streams) = self.max_streams {
            config.tuner.max_streams = Some(max_streams);
        }
        if let Some(executable) = self.browser {
            config.browser.executable = Some(path_string(executable));
        }
        if let Some(profile_dir) = self.profile_dir {
            config.browser.profile_dir = Some(path_string(profile_dir));
        }
        if self.headless {
            config.browser.headless = Some(true);
        }
        if let Some(output) = self.output {
            config.capture.output = Some(output);
        }
        if let Some(ffmpeg) = self.ffmpeg {
            config.capture.ffmpeg = Some(path_string(ffmpeg));
        }
        if let Some(log_dir) = self.log_dir {
            config.logging.log_dir = Some(path_string(log_dir));
        }
        if let Some(days) = self.log_retention_days {
            config.logging.retention_days = Some(days);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = config::resolve_config_path(args.config.take(), &PathBuf::from("."));
    let mut file_config = match &config_path {
        Some(path) => match config::load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    let verbose = args.verbose;
    args.apply_to(&mut file_config);

    logging::init_logging(
        &file_config.log_dir(),
        file_config.log_retention_days(),
        verbose,
        file_config.logging.level.as_deref(),
    )?;

    let listen_addr = file_config.listen_addr()?;
    let lineup = file_config.lineup()?;
    let identity = file_config.device_identity()?;
    let pipeline_config = file_config.pipeline_config()?;
    let browser_options = file_config.browser_options();

    info!("chrometuner starting...");
    info!("  Listen address: {}", listen_addr);
    info!("  Device: {} ({})", identity.friendly_name, identity.device_id);
    info!("  Max streams: {}", identity.tuner_count);
    info!("  Channels: {}", lineup.len());
    info!("  Output: {:?}", pipeline_config.output);
    info!("  Browser profile: {}", browser_options.profile_dir.display());

    let browser = Arc::new(BrowserManager::new(browser_options));
    let pages = Arc::new(PagePool::new(browser.clone()));
    let admission = Arc::new(AdmissionController::new(identity.tuner_count));
    let pipeline = CapturePipeline::new(pages.clone(), admission.clone(), pipeline_config);

    let state = Arc::new(AppState::new(
        lineup,
        identity,
        admission,
        pages,
        pipeline,
        Some(browser),
        file_config.server.base_url.clone(),
        listen_addr.port(),
    ));

    if file_config.discovery_enabled() {
        let discovery_addr = file_config.discovery_addr()?;
        if discovery_addr.port() == listen_addr.port() {
            info!("Discovery listener shares the primary port, skipping");
        } else {
            let discovery_state = Arc::clone(&state);
            tokio::spawn(async move {
                web::start_discovery_server(discovery_addr, discovery_state).await;
            });
        }
    }

    tokio::select! {
        result = web::start_web_server(listen_addr, state) => {
            if let Err(e) = &result {
                error!("Tuner server error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
