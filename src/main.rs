use std::path::PathBuf;

use clap::Parser;
use parley_server::ServerConfig;
use parley_settings::{load_settings_from_path, settings_path, ParleySettings};
use parley_telemetry::{default_log_db_path, init_telemetry, TelemetryConfig};

mod console;

use console::{Command, Console};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Multi-client WebSocket chat server")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json or $PARLEY_SETTINGS).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Serve until Ctrl-C without the operator console; logs go to stderr.
    #[arg(long, alias = "no-console")]
    headless: bool,

    /// Start the server as soon as the console opens.
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let loaded = load_settings_from_path(&path);
    let mut settings = loaded.as_ref().cloned().unwrap_or_else(|_| ParleySettings::default());
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(TelemetryConfig {
        level: settings.logging.level.clone(),
        stderr: cli.headless,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: settings
            .logging
            .log_db_path
            .clone()
            .unwrap_or_else(default_log_db_path),
        console_buffer_lines: settings.logging.console_buffer_lines,
    })?;

    if let Err(e) = &loaded {
        tracing::warn!(path = %path.display(), error = %e, "failed to load settings, using defaults");
    }
    tracing::info!(path = %path.display(), port = settings.server.port, "starting parley");

    if cli.headless {
        let handle = parley_server::start(ServerConfig::from(&settings.server)).await?;
        tracing::info!(addr = %handle.local_addr(), "serving until Ctrl-C");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        handle.stop().await;
        return Ok(());
    }

    let mut console = Console::new(settings, path, telemetry.log_buffer());
    if cli.autostart {
        console.execute(Command::Start, &mut std::io::stdout()).await?;
    }
    console.run().await
}
