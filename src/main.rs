use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{error, info, warn};
use tokio::time::MissedTickBehavior;

use gpuscope::db::Database;
use gpuscope::export;
use gpuscope::models::Snapshot;
use gpuscope::sampler;
use gpuscope::session::Config;
use gpuscope::tui;

#[derive(Parser)]
#[command(name = "gpuscope")]
#[command(version)]
#[command(about = "GPU telemetry recorder with live and historical terminal views")]
struct Cli {
    /// Sampling interval in seconds
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Custom database path (default: <data dir>/gpuscope/gpuscope.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Export one snapshot and exit
    #[arg(long, value_enum)]
    export: Option<ExportFormat>,

    /// Output file for --export (default: stdout)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Sample once, print a summary, and exit (no dashboard)
    #[arg(long)]
    once: bool,

    /// Continuously sample and save without the dashboard
    #[arg(long)]
    continuous: bool,

    /// List users currently using GPUs and exit
    #[arg(long)]
    list_users: bool,

    /// Alert threshold for GPU temperature (°C)
    #[arg(long, default_value_t = 90.0)]
    max_temp: f64,

    /// Alert threshold for memory utilization (%)
    #[arg(long, default_value_t = 95.0)]
    max_mem: f64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let one_shot = cli.once || cli.list_users || cli.export.is_some();
    let dashboard = !one_shot && !cli.continuous;

    // Under the alternate screen, stderr logging would scribble over the
    // dashboard; RUST_LOG still overrides.
    let default_filter = if dashboard { "error" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if one_shot {
        return run_one_shot(&cli);
    }

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let db = Database::new(db_path).context("failed to open snapshot store")?;

    let config = Config {
        sample_interval: Duration::from_secs(cli.interval.max(1)),
        max_temp_c: cli.max_temp,
        max_mem_pct: cli.max_mem,
    };

    if cli.continuous {
        return run_continuous(db, config).await;
    }

    tui::run(db, config).await
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("could not determine data directory"))?;
    Ok(base.join("gpuscope").join("gpuscope.db"))
}

/// `--once`, `--list-users`, and `--export`: one sample, one output, exit.
fn run_one_shot(cli: &Cli) -> Result<()> {
    let snapshot = sampler::sample().context("failed to sample")?;

    for alert in export::threshold_alerts(&snapshot, cli.max_temp, cli.max_mem) {
        warn!("{alert}");
    }

    if cli.list_users {
        print_users(&snapshot);
        return Ok(());
    }

    if let Some(format) = cli.export {
        let rendered = match format {
            ExportFormat::Json => export::to_json(&snapshot)?,
            ExportFormat::Csv => export::to_csv(&snapshot),
        };
        match &cli.output {
            Some(path) => std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => print!("{rendered}"),
        }
        return Ok(());
    }

    print_summary(&snapshot);
    Ok(())
}

fn print_users(snapshot: &Snapshot) {
    println!("Users currently using GPUs:");
    println!("{:<16} {:>12}", "User", "Memory (MB)");
    for usage in export::aggregate_by_user(snapshot) {
        println!("{:<16} {:>12.1}", usage.owner, usage.mem_used_mb);
    }
}

fn print_summary(snapshot: &Snapshot) {
    println!("Snapshot at {}", snapshot.ts.to_rfc3339());
    for device in &snapshot.devices {
        println!(
            "GPU {}: {} - Util: {:.1}%, Mem: {:.1}%, Temp: {:.1}°C",
            device.index, device.name, device.util_gpu, device.util_mem, device.temp_c
        );
    }
}

/// Headless recorder: sample and save on a fixed cadence until Ctrl-C.
async fn run_continuous(db: Database, config: Config) -> Result<()> {
    info!(
        "continuous mode: sampling every {}s (Ctrl+C to stop)",
        config.sample_interval.as_secs()
    );

    let mut ticker = tokio::time::interval(config.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sampled = tokio::task::spawn_blocking(sampler::sample)
                    .await
                    .context("sampler task failed")?;
                match sampled {
                    Ok(snapshot) => {
                        for alert in export::threshold_alerts(
                            &snapshot,
                            config.max_temp_c,
                            config.max_mem_pct,
                        ) {
                            warn!("{alert}");
                        }
                        match db.save_snapshot(&snapshot).await {
                            Ok(id) => info!(
                                "[{}] saved snapshot #{id}",
                                snapshot.ts.format("%H:%M:%S")
                            ),
                            Err(err) => error!("save error: {err:#}"),
                        }
                    }
                    Err(err) => error!("sample error: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                break;
            }
        }
    }

    Ok(())
}
