use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vcache_sim::{Orchestrator, ProxyKind, SimConfig};

/// Trace-driven simulator for video-caching proxy policies
#[derive(Parser)]
#[command(name = "vcache-sim", version)]
struct Cli {
    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = "config.yaml")]
    config: PathBuf,

    /// Override the trace file from the configuration
    #[arg(long, value_name = "PATH")]
    trace: Option<PathBuf>,

    /// Override the video catalog file from the configuration
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Override the simulation speed
    #[arg(long, value_name = "FACTOR")]
    speed: Option<u32>,

    /// Proxy to replay (ForwardProxy, FIFOProxy, LRUProxy, UnlimitedProxy)
    #[arg(long, value_name = "NAME")]
    proxy: Option<ProxyKind>,

    /// Replay a second proxy on the same trace for comparison
    #[arg(long = "compare-to", value_name = "NAME")]
    compare_to: Option<ProxyKind>,

    /// Run the two replays concurrently instead of back to back
    #[arg(long, requires = "compare_to")]
    parallel: bool,

    /// Force idle skipping on
    #[arg(long, overrides_with = "no_skip")]
    skip: bool,

    /// Force idle skipping off
    #[arg(long)]
    no_skip: bool,

    /// Force video consumption on
    #[arg(long, overrides_with = "no_consume")]
    consume: bool,

    /// Force video consumption off
    #[arg(long)]
    no_consume: bool,

    /// Output directory for the statistics CSVs
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,
}

impl Cli {
    fn apply_to(&self, config: &mut SimConfig) {
        if let Some(trace) = &self.trace {
            config.orchestration.trace_file = trace.display().to_string();
        }
        if let Some(db) = &self.db {
            config.orchestration.db_file = db.display().to_string();
        }
        if let Some(speed) = self.speed {
            config.simulation.speed = speed as f64;
        }
        if self.skip {
            config.orchestration.skip_inactivity = true;
        } else if self.no_skip {
            config.orchestration.skip_inactivity = false;
        }
        if self.consume {
            config.clients.consume_videos = true;
        } else if self.no_consume {
            config.clients.consume_videos = false;
        }
        if let Some(proxy) = self.proxy {
            config.proxy.proxy_type = proxy;
        }
        if let Some(out) = &self.out {
            config.data.data_out = out.display().to_string();
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vcache_sim={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_replay(config: SimConfig, kind: ProxyKind, out: PathBuf) -> Result<()> {
    info!(proxy = %kind, "starting replay");

    let mut orchestrator = Orchestrator::with_proxy(config, kind);
    orchestrator.set_up()?;
    orchestrator.run().await?;
    orchestrator.wait_end().await;
    orchestrator.gather_statistics(&out)?;

    let recorder = orchestrator.recorder();
    match recorder.mean_latency() {
        Some(mean) => info!(
            proxy = %kind,
            samples = recorder.latencies().len(),
            mean_latency_s = format_args!("{mean:.3}"),
            stalls = recorder.stall_count(),
            "replay finished"
        ),
        None => info!(proxy = %kind, "replay finished without playback samples"),
    }
    if let Some(stats) = orchestrator.proxy_stats() {
        info!(
            proxy = %kind,
            cache_hits = stats.cache_hits,
            nb_served = stats.nb_served,
            hit_ratio = format_args!("{:.3}", stats.hit_ratio),
            kb_hit_ratio = format_args!("{:.3}", stats.kb_hit_ratio),
            "proxy statistics"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let mut config = SimConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    cli.apply_to(&mut config);
    config.validate().context("configuration rejected")?;

    let primary = config.proxy.proxy_type;
    let out_root = PathBuf::from(&config.data.data_out);

    match cli.compare_to {
        None => run_replay(config, primary, out_root).await?,
        Some(other) => {
            // Each replay owns its own clock and gauge, so the two runs can
            // share one process whether sequential or concurrent.
            let dir_a = out_root.join(primary.to_string());
            let dir_b = out_root.join(other.to_string());
            if cli.parallel {
                tokio::try_join!(
                    run_replay(config.clone(), primary, dir_a),
                    run_replay(config.clone(), other, dir_b)
                )?;
            } else {
                run_replay(config.clone(), primary, dir_a).await?;
                run_replay(config, other, dir_b).await?;
            }
        }
    }

    Ok(())
}
