// ============================================================================
// main.rs — particle-sync
// Entry point. Initializes logging, parses the command line, and runs the
// headless pipeline.
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use particle_sync::config::RenderConfig;
use particle_sync::headless::{run_soft, run_wgpu, HeadlessConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Worker-thread software adapter
    Soft,
    /// wgpu adapter
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "particle-sync")]
#[command(about = "Drive the producer/copy/render synchronization pipeline headlessly")]
struct Cli {
    /// JSON render configuration; defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "soft")]
    backend: Backend,

    /// Frames to render
    #[arg(long, default_value_t = 1_000)]
    frames: u32,

    /// Particles drawn per frame (defaults to the configured capacity)
    #[arg(long)]
    particles: Option<u32>,

    /// Particles copied per frame (defaults to the drawn count)
    #[arg(long)]
    copied: Option<u32>,

    /// Run the producer on a second adapter linked through shared handles
    #[arg(long)]
    cross_adapter: bool,

    /// Wait for every frame to finish before starting the next
    #[arg(long)]
    sync: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Frames between progress log lines (0 disables)
    #[arg(long, default_value_t = 250)]
    progress_interval: u32,

    /// Simulated per-submission latency of the software adapter, in microseconds
    #[arg(long, default_value_t = 0)]
    latency_us: u64,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> particle_sync::PipelineResult<()> {
    let mut render = match &cli.config {
        Some(path) => RenderConfig::load(path)?,
        None => RenderConfig::default(),
    };
    render.features.cross_adapter |= cli.cross_adapter;

    let config = HeadlessConfig {
        frames: cli.frames,
        particles: cli.particles,
        copied: cli.copied,
        cross_adapter: render.features.cross_adapter,
        async_mode: !cli.sync,
        progress_interval: cli.progress_interval,
        latency: Duration::from_micros(cli.latency_us),
        report_path: cli.report,
        render,
    };

    let report = match cli.backend {
        Backend::Soft => run_soft(&config)?,
        Backend::Wgpu => run_wgpu(&config)?,
    };
    log::info!(
        "{} frames on '{}' ({}), render fence {}",
        report.frames,
        report.render_adapter,
        report.backend,
        report.final_render_fence
    );
    Ok(())
}
