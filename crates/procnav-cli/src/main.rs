use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procnav_engine::{maybe_build_scheduler, EngineConfig, LogDigestSink, NoticeEngine};
use procnav_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "procnav")]
#[command(about = "Procurement notice navigator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP transport and, when enabled, the digest schedule.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply navigation tokens in order and print the last screen as JSON.
    Navigate {
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Print today's newly published open works notices.
    Digest,
    /// Validate the endpoint mapping and keyword rules, then exit.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let engine = Arc::new(NoticeEngine::from_config(&config)?);

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let scheduler = maybe_build_scheduler(&config, engine.clone(), Arc::new(LogDigestSink)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(
                    cron_1 = %config.digest_cron_1,
                    cron_2 = %config.digest_cron_2,
                    timezone = %config.timezone,
                    "digest scheduler started"
                );
            }
            let port = port.unwrap_or_else(procnav_web::port_from_env);
            procnav_web::serve(AppState::new(engine), port).await?;
        }
        Commands::Navigate { tokens } => {
            let mut last = None;
            for token in &tokens {
                last = Some(
                    engine
                        .navigate(token)
                        .await
                        .with_context(|| format!("navigating `{token}`"))?,
                );
            }
            if let Some(screen) = last {
                println!("{}", serde_json::to_string_pretty(&screen)?);
            }
        }
        Commands::Digest => {
            let digest = engine.todays_open_notices().await?;
            if digest.is_empty() {
                println!("no open works notices published on {}", digest.date);
            } else {
                println!("{}", digest.render_text());
            }
        }
        Commands::CheckConfig => {
            let regions = engine
                .rules()
                .regions()
                .iter()
                .map(|r| r.code.as_str())
                .collect::<Vec<_>>()
                .join(",");
            println!(
                "config ok: feeds={} regions={} timezone={}",
                config.feeds_path().display(),
                regions,
                config.timezone
            );
        }
    }

    Ok(())
}
