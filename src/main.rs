use std::fs::{self, File};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use log::{LevelFilter, error, info};
use simplelog::{Config, WriteLogger};

use logdeck::local::{FileCatalog, FileSubscriber};
use logdeck::prefs::Preferences;
use logdeck::{App, AppConfig};

const LOG_FILE_ENV: &str = "LOGDECK_LOG_FILE";
const LOG_LEVEL_ENV: &str = "LOGDECK_LOG";

fn print_usage(binary: &str) {
    eprintln!(
        "Usage: {}\n\nPick log sources and follow them live. Sources come from the profiles\nin ./.logdeck.json, ~/.logdeck.json or the config directory (default: /var/log).\nDiagnostics go to ${} (level from ${}).",
        binary, LOG_FILE_ENV, LOG_LEVEL_ENV
    );
}

fn log_path() -> PathBuf {
    if let Some(path) = std::env::var_os(LOG_FILE_ENV) {
        return PathBuf::from(path);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("logdeck")
        .join("logdeck.log")
}

/// The terminal belongs to the UI, so diagnostics go to a file.
fn init_logging() -> anyhow::Result<PathBuf> {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Info);

    let path = log_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    let file =
        File::create(&path).with_context(|| format!("creating log file {}", path.display()))?;
    WriteLogger::init(level, Config::default(), file).context("installing the logger")?;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic: {panic_info}");
    }));
    Ok(path)
}

async fn run() -> anyhow::Result<()> {
    let log_file = init_logging()?;
    info!(
        "logdeck {} starting, logging to {}",
        env!("CARGO_PKG_VERSION"),
        log_file.display()
    );

    let prefs = Preferences::load_default();
    let config = AppConfig {
        catalog: Arc::new(FileCatalog::from_preferences(&prefs)),
        subscriber: Arc::new(FileSubscriber::default()),
        excluded_profiles: prefs.exclude_profiles.clone(),
        utc_offset: prefs.utc_offset(),
    };

    let app = App::open(config).await?;
    app.run().await
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args();
    let binary = args.next().unwrap_or_else(|| "logdeck".to_owned());
    if args.next().is_some() {
        print_usage(&binary);
        std::process::exit(2);
    }

    if let Err(err) = run().await {
        eprintln!("logdeck failed: {err:#}");
        std::process::exit(1);
    }
}
