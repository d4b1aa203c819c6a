//! Session: one car on one track, driven tick by tick through episodes.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::car::Car;
use crate::dqn::DeepQDriver;
use crate::driver::{Command, DriveMode, Driver, PlayerDriver};
use crate::error::SimulationFault;
use crate::evaluator::{LineEvaluator, Termination};
use crate::log;
use crate::track::Track;
use crate::train::{TrainingConfig, TrainingWorker};
use crate::web::{EpisodeRecord, LossRecord, SharedStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Episode time cap in simulated seconds.
    pub max_episode_seconds: f32,
    /// Subtracted from the tick reward when the car leaves the track.
    pub crash_penalty: f32,
    pub train_tick_hz: f32,
    pub play_tick_hz: f32,
    /// Train on the worker thread instead of inline at episode end.
    pub background_training: bool,
    pub shutdown_timeout_secs: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_episode_seconds: 300.0,
            crash_penalty: 10.0,
            train_tick_hz: 30.0,
            play_tick_hz: 60.0,
            background_training: true,
            shutdown_timeout_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Play,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    OffTrack,
    Stalled,
    TimeLimit,
}

impl From<Termination> for EndReason {
    fn from(t: Termination) -> Self {
        match t {
            Termination::OffTrack => EndReason::OffTrack,
            Termination::Stalled => EndReason::Stalled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub episode: u64,
    pub score: f32,
    pub ticks: u64,
    pub elapsed: f32,
    pub reason: EndReason,
    /// Exploration rate the episode was played with.
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// First frame after a reset is not simulated.
    Skipped,
    Running,
    EpisodeEnded(EpisodeSummary),
    /// The tick failed; the episode was discarded and restarted.
    Faulted(SimulationFault),
}

pub struct Session {
    cfg: SessionConfig,
    training: TrainingConfig,
    mode: RunMode,
    track: Track,
    car: Car,
    evaluator: LineEvaluator,
    agent: DeepQDriver,
    player: Option<PlayerDriver>,
    worker: Option<TrainingWorker>,
    stats: SharedStats,

    episode: u64,
    elapsed: f32,
    ticks: u64,
    last_score: f32,
    skip_next_frame: bool,
    passes: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SessionConfig,
        training: TrainingConfig,
        mode: RunMode,
        track: Track,
        car: Car,
        evaluator: LineEvaluator,
        agent: DeepQDriver,
        stats: SharedStats,
    ) -> Self {
        let worker = if mode == RunMode::Train && cfg.background_training {
            match TrainingWorker::spawn(agent.trainer()) {
                Ok(w) => Some(w),
                Err(e) => {
                    log::warn(&format!("cannot start training thread ({e}); training inline"));
                    None
                }
            }
        } else {
            None
        };
        let mut session = Self {
            cfg,
            training,
            mode,
            track,
            car,
            evaluator,
            agent,
            player: None,
            worker,
            stats,
            episode: 0,
            elapsed: 0.0,
            ticks: 0,
            last_score: 0.0,
            skip_next_frame: false,
            passes: 0,
        };
        session.reset_episode();
        session
    }

    /// Hand the wheel to a human (or back to the agent with `None`).
    pub fn set_player(&mut self, player: Option<PlayerDriver>) {
        self.player = player;
    }

    pub fn car(&self) -> &Car {
        &self.car
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn evaluator(&self) -> &LineEvaluator {
        &self.evaluator
    }

    pub fn agent(&self) -> &DeepQDriver {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut DeepQDriver {
        &mut self.agent
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Fixed tick length for the current mode.
    pub fn tick_dt(&self) -> f32 {
        let hz = match self.mode {
            RunMode::Train => self.cfg.train_tick_hz,
            RunMode::Play => self.cfg.play_tick_hz,
        };
        1.0 / hz.max(1.0)
    }

    /// Advance the simulation by `dt` seconds.
    pub fn tick(&mut self, dt: f32) -> TickOutcome {
        self.collect_reports();
        if self.skip_next_frame {
            self.skip_next_frame = false;
            return TickOutcome::Skipped;
        }
        match self.step(dt) {
            Ok(outcome) => outcome,
            Err(fault) => {
                log::warn(&format!("episode {}: {fault}; restarting episode", self.episode));
                self.agent.clear_memory();
                self.reset_episode();
                TickOutcome::Faulted(fault)
            }
        }
    }

    fn step(&mut self, dt: f32) -> Result<TickOutcome, SimulationFault> {
        let learning = self.mode == RunMode::Train && self.player.is_none();
        let mode = match self.mode {
            RunMode::Train => DriveMode::Training,
            RunMode::Play => DriveMode::Evaluation,
        };

        let mut observed = None;
        let cmd = if let Some(player) = self.player.as_mut() {
            player.command(&self.car, &self.track, mode)?
        } else if learning {
            let state = self.agent.get_input_data(&self.car, &self.track)?;
            let (turn_rate, acceleration_rate, action) = self.agent.command_for_state(&state, &self.car, true)?;
            observed = Some(state);
            Command { turn_rate, acceleration_rate, action: Some(action) }
        } else {
            self.agent.command(&self.car, &self.track, mode)?
        };

        self.car.advance(cmd.turn_rate, cmd.acceleration_rate, dt);
        if !self.car.is_finite() {
            let p = self.car.position();
            return Err(SimulationFault::NonFiniteState { x: p.x, y: p.y });
        }
        let alive = self.evaluator.evaluate(&self.car, &self.track, dt)?;
        self.elapsed += dt.max(0.0);
        self.ticks += 1;

        let score = self.evaluator.get_score();
        let mut reward = score - self.last_score;
        self.last_score = score;
        if self.evaluator.termination() == Some(Termination::OffTrack) {
            reward -= self.cfg.crash_penalty;
        }

        if let (Some(state), Some(action)) = (observed, cmd.action) {
            let next_state = self.agent.get_input_data(&self.car, &self.track)?;
            self.agent.remember(state, action, reward, next_state, !alive);
        }

        let reason = match self.evaluator.termination() {
            Some(t) => Some(EndReason::from(t)),
            None if self.elapsed >= self.cfg.max_episode_seconds => Some(EndReason::TimeLimit),
            None => None,
        };
        Ok(match reason {
            Some(reason) => TickOutcome::EpisodeEnded(self.finish_episode(reason)),
            None => TickOutcome::Running,
        })
    }

    fn finish_episode(&mut self, reason: EndReason) -> EpisodeSummary {
        let summary = EpisodeSummary {
            episode: self.episode,
            score: self.evaluator.get_score(),
            ticks: self.ticks,
            elapsed: self.elapsed,
            reason,
            epsilon: self.agent.epsilon(),
        };

        // player-driven episodes record nothing, so they neither train nor decay
        if self.mode == RunMode::Train && self.player.is_none() {
            match self.agent.dump_memory_to_cache() {
                Ok(n) => log::debug(&format!("episode {}: {n} transitions cached", self.episode)),
                Err(e) => log::error(&format!("episode {}: replay cache write failed: {e}", self.episode)),
            }
            self.start_training();
            self.agent.decay_epsilon();
        }

        log::info(&format!(
            "episode {} | score {:.1} | ticks {} | epsilon {:.3} | {:?}",
            summary.episode, summary.score, summary.ticks, summary.epsilon, summary.reason
        ));
        self.stats.lock().record_episode(EpisodeRecord {
            episode: summary.episode,
            score: summary.score,
            epsilon: summary.epsilon,
            ticks: summary.ticks,
            reason,
            finished_at: chrono::Local::now().to_rfc3339(),
        });

        self.episode += 1;
        self.reset_episode();
        self.skip_next_frame = true;
        summary
    }

    fn start_training(&mut self) {
        let (batch, epochs) = (self.training.batch_size, self.training.epochs);
        match &self.worker {
            Some(worker) => {
                if worker.try_submit(batch, epochs) {
                    log::debug("training pass started");
                } else {
                    log::info("training pass still running; skipping this episode's pass");
                }
            }
            None => {
                let start = Instant::now();
                let loss = self.agent.replay_memory(batch, epochs);
                self.record_loss(loss, start.elapsed());
            }
        }
    }

    fn collect_reports(&mut self) {
        let reports = match &self.worker {
            Some(worker) => worker.poll(),
            None => return,
        };
        for r in reports {
            self.record_loss(r.loss, r.duration);
        }
    }

    fn record_loss(&mut self, loss: Option<f32>, duration: Duration) {
        self.passes += 1;
        match loss {
            Some(l) => log::info(&format!("training pass {} | loss {l:.6} | {:.2?}", self.passes, duration)),
            None => log::info(&format!("training pass {} | no loss (not enough data or failed)", self.passes)),
        }
        self.stats.lock().record_loss(LossRecord {
            pass: self.passes,
            loss,
            duration_ms: duration.as_millis() as u64,
        });
    }

    fn reset_episode(&mut self) {
        self.car.init_position(self.track.start_point, self.track.start_direction);
        self.evaluator.reset_score(&self.car);
        self.elapsed = 0.0;
        self.ticks = 0;
        self.last_score = self.evaluator.get_score();
    }

    /// Wait for an in-flight training pass (bounded), then save the model
    /// when training. Consumes the session.
    pub fn shutdown(mut self, model_path: Option<&Path>) -> std::io::Result<()> {
        if let Some(worker) = self.worker.take() {
            let timeout = Duration::from_secs_f32(self.cfg.shutdown_timeout_secs.max(0.0));
            for r in worker.shutdown(timeout).reports {
                self.record_loss(r.loss, r.duration);
            }
        }
        match (self.mode, model_path) {
            (RunMode::Train, Some(path)) => self.agent.save_model_weights(path),
            _ => Ok(()),
        }
    }
}
