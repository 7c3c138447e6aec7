//! kart CLI: announcement server, button monitor and remote control.
//!
//! ```text
//! kart serve   [--config config.toml]
//! kart buttons [--config config.toml]
//! kart speak "Please remain seated" [--config ...]
//! kart warm    [--config ...]
//! kart play "Track is open" [--server http://localhost:5000]
//! kart status / clear-cache / reset [--server ...]
//! ```

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kart_lib::announcer::Announcer;
use kart_lib::config::SharedConfig;
use kart_lib::gpio::ButtonMonitor;
use kart_lib::kart_core::types::Source;

const DEFAULT_SERVER: &str = "http://localhost:5000";

/// kart: go-kart track announcements
#[derive(Parser)]
#[command(name = "kart", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Watch the GPIO buttons and announce their slots
    Buttons {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Speak text on this machine and wait for it to finish
    Speak {
        text: String,
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Pre-generate audio for every slot text
    Warm {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Ask a running server to announce text
    Play {
        text: String,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show whether an announcement is playing
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Delete cached audio on a running server
    ClearCache {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Force-clear a stuck playback claim
    Reset {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kart_lib=debug,kart=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            let announcer = announcer(config)?;
            kart_lib::server::serve(announcer, shutdown_signal())
                .await
                .context("server error")?;
        }

        Command::Buttons { config } => {
            let announcer = announcer(config)?;
            ButtonMonitor::from_config(announcer)?
                .run(shutdown_signal())
                .await?;
        }

        Command::Speak { text, config } => {
            let announcer = announcer(config)?;
            let admitted = announcer.announce_text(Source::Web("cli".into()), &text).await?;
            let report = admitted.finished().await?;
            info!("played in {:.1}s", report.duration.as_secs_f64());
        }

        Command::Warm { config } => {
            let announcer = announcer(config)?;
            let ready = announcer.warm().await;
            println!("{ready} announcement(s) cached");
        }

        Command::Play { text, server } => {
            let resp = reqwest::Client::new()
                .post(format!("{server}/play_instant"))
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await
                .context("request failed")?;
            print_response(resp).await?;
        }

        Command::Status { server } => {
            let resp = reqwest::Client::new()
                .get(format!("{server}/announcement_status"))
                .send()
                .await
                .context("request failed")?;
            print_response(resp).await?;
        }

        Command::ClearCache { server } => post_simple(&server, "clear_cache").await?,
        Command::Reset { server } => post_simple(&server, "reset_locks").await?,
    }
    Ok(())
}

fn announcer(config: PathBuf) -> anyhow::Result<Announcer> {
    let shared = SharedConfig::load(&config)
        .with_context(|| format!("loading {}", config.display()))?;
    Ok(Announcer::bootstrap(shared)?)
}

async fn post_simple(server: &str, endpoint: &str) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .send()
        .await
        .context("request failed")?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!("{status}: {body}");
    }
    println!("{body}");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}
