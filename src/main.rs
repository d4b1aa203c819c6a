use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use self_driving_car::car::Car;
use self_driving_car::config::AppConfig;
use self_driving_car::db::ReplayCache;
use self_driving_car::dqn::DeepQDriver;
use self_driving_car::error::ModelLoadError;
use self_driving_car::evaluator::LineEvaluator;
use self_driving_car::game::{RunMode, Session, TickOutcome};
use self_driving_car::log;
use self_driving_car::track::Track;
use self_driving_car::web::{shared_stats, spawn_stats_server};

#[derive(Parser)]
#[command(name = "self_driving_car", about = "A car learns to drive a closed track with deep Q-learning")]
struct Cli {
    /// TOML config; defaults are used when the file is missing.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Learn from scratch or continue from the saved model.
    Train {
        #[arg(long, default_value_t = 1000)]
        episodes: u64,
        /// Serve training stats over HTTP on this port.
        #[arg(long)]
        stats_port: Option<u16>,
    },
    /// Drive greedily with the saved model; nothing is learned.
    Play {
        #[arg(long, default_value_t = 5)]
        episodes: u64,
    },
}

fn main() -> anyhow::Result<()> {
    log::init("info");
    let cli = Cli::parse();
    let cfg = AppConfig::load_or_default(&cli.config)?;

    let track = Track::load_from_file(&cfg.paths.track)
        .with_context(|| format!("loading track {}", cfg.paths.track.display()))?;
    let mut car = Car::new(cfg.car.clone());
    car.init_position(track.start_point, track.start_direction);
    let evaluator = LineEvaluator::load_lines_with_config(cfg.evaluator.clone(), &car, &track, &cfg.paths.lines)
        .with_context(|| format!("loading checkpoint lines {}", cfg.paths.lines.display()))?;
    log::info(&format!(
        "track {} with {} checkpoints",
        cfg.paths.track.display(),
        evaluator.lines().len()
    ));

    if let Some(dir) = cfg.paths.replay_cache.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let cache = ReplayCache::open(&cfg.paths.replay_cache, cfg.agent.cache_capacity)
        .with_context(|| format!("opening replay cache {}", cfg.paths.replay_cache.display()))?;
    let mut agent = DeepQDriver::new(cfg.agent.clone(), cache);
    match agent.load_model_weights(&cfg.paths.model) {
        Ok(()) => {}
        Err(ModelLoadError::NotFound(_)) => log::info("no saved model, starting with fresh parameters"),
        Err(e) => log::warn(&format!("{e}; starting with fresh parameters")),
    }

    let (mode, episodes, stats_port) = match cli.command {
        Cmd::Train { episodes, stats_port } => (RunMode::Train, episodes, stats_port),
        Cmd::Play { episodes } => (RunMode::Play, episodes, None),
    };

    let stats = shared_stats();
    if let Some(port) = stats_port {
        spawn_stats_server(stats.clone(), port).context("starting stats server")?;
    }
    let mut session = Session::new(
        cfg.session.clone(),
        cfg.training.clone(),
        mode,
        track,
        car,
        evaluator,
        agent,
        stats,
    );

    let dt = session.tick_dt();
    let mut finished = 0;
    while finished < episodes {
        if let TickOutcome::EpisodeEnded(_) = session.tick(dt) {
            finished += 1;
        }
    }

    session
        .shutdown(Some(&cfg.paths.model))
        .with_context(|| format!("saving model to {}", cfg.paths.model.display()))?;
    Ok(())
}
