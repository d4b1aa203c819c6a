//! Checkpoint-line evaluator: progress scoring and episode termination.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::car::Car;
use crate::error::{AssetFormatError, SimulationFault};
use crate::track::Track;
use crate::utils::{Segment, Vec2, segment_intersection};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Score added per valid checkpoint crossing.
    pub checkpoint_reward: f32,
    /// Seconds without a new checkpoint before the episode is stalled.
    pub stall_timeout: f32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        EvaluatorConfig { checkpoint_reward: 1.0, stall_timeout: 5.0 }
    }
}

/// Why an episode stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    OffTrack,
    Stalled,
}

/// Ordered checkpoint lines around a track.
///
/// Crossing line `i` only counts when the last crossed line was `i - 1 (mod N)`;
/// anything else (reverse crossings, skipped lines) is ignored.
#[derive(Debug, Clone)]
pub struct LineEvaluator {
    cfg: EvaluatorConfig,
    lines: Vec<Segment>,
    start_last_index: usize,
    last_crossed_index: usize,
    score: f32,
    since_progress: f64,
    termination: Option<Termination>,
    last_position: Vec2,
}

impl LineEvaluator {
    /// Build from in-memory checkpoint lines; the car's current position is the
    /// start of the first swept path.
    pub fn new(cfg: EvaluatorConfig, lines: Vec<Segment>, car: &Car, track: &Track) -> Self {
        let start_last_index = Self::start_index(&lines, track);
        Self {
            cfg,
            lines,
            start_last_index,
            last_crossed_index: start_last_index,
            score: 0.0,
            since_progress: 0.0,
            termination: None,
            last_position: car.position(),
        }
    }

    /// Read `x1 y1 x2 y2` lines from `path`.
    ///
    /// Every endpoint must lie within the track's bounds grown by the car's
    /// diagonal, otherwise the file was drawn for another coordinate frame.
    pub fn load_lines_from_file(
        car: &Car,
        track: &Track,
        path: impl AsRef<Path>,
    ) -> Result<Self, AssetFormatError> {
        Self::load_lines_with_config(EvaluatorConfig::default(), car, track, path)
    }

    pub fn load_lines_with_config(
        cfg: EvaluatorConfig,
        car: &Car,
        track: &Track,
        path: impl AsRef<Path>,
    ) -> Result<Self, AssetFormatError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| AssetFormatError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut lines = Vec::new();
        for (i, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let nums = line
                .split_whitespace()
                .map(|w| w.parse::<f32>().ok().filter(|v| v.is_finite()))
                .collect::<Option<Vec<f32>>>();
            let syntax = |reason: &str| AssetFormatError::Syntax {
                path: path.to_path_buf(),
                line: i + 1,
                reason: reason.to_string(),
            };
            let nums = nums.ok_or_else(|| syntax("invalid number"))?;
            if nums.len() != 4 {
                return Err(syntax("expected 4 numbers: x1 y1 x2 y2"));
            }
            let seg = Segment::new(Vec2::new(nums[0], nums[1]), Vec2::new(nums[2], nums[3]));
            if seg.length() <= 0.0 {
                return Err(syntax("zero-length checkpoint line"));
            }
            lines.push(seg);
        }
        if lines.is_empty() {
            return Err(AssetFormatError::Empty(path.to_path_buf()));
        }

        let (min, max) = track.bounds();
        let margin = car.width().hypot(car.height());
        let inside = |p: Vec2| {
            p.x >= min.x - margin && p.x <= max.x + margin && p.y >= min.y - margin && p.y <= max.y + margin
        };
        if let Some(k) = lines.iter().position(|s| !inside(s.a) || !inside(s.b)) {
            return Err(AssetFormatError::Invalid {
                path: path.to_path_buf(),
                reason: format!("checkpoint {k} lies outside the track frame"),
            });
        }

        Ok(Self::new(cfg, lines, car, track))
    }

    /// Index of the checkpoint just behind the start point. The nearest
    /// checkpoint is the next one when it lies strictly ahead along the start
    /// heading; otherwise the car starts on or past it.
    fn start_index(lines: &[Segment], track: &Track) -> usize {
        let dist = |s: &Segment| s.midpoint().distance(track.start_point);
        let Some((nearest, seg)) = lines.iter().enumerate().min_by(|a, b| dist(a.1).total_cmp(&dist(b.1)))
        else {
            return 0;
        };
        let ahead = (seg.midpoint() - track.start_point).dot(track.start_direction) > 1e-3;
        if ahead { (nearest + lines.len() - 1) % lines.len() } else { nearest }
    }

    /// Score the car's movement since the previous call.
    /// Returns `Ok(true)` while the episode should continue.
    pub fn evaluate(&mut self, car: &Car, track: &Track, dt: f32) -> Result<bool, SimulationFault> {
        if self.termination.is_some() {
            return Ok(false);
        }
        let pos = car.position();
        if !car.is_finite() {
            return Err(SimulationFault::NonFiniteState { x: pos.x, y: pos.y });
        }

        let from = self.last_position;
        self.last_position = pos;
        self.since_progress += dt as f64;

        // a long sweep may pass several lines; they still have to come in order
        for _ in 0..self.lines.len() {
            let next = self.next_index();
            let line = self.lines[next];
            if segment_intersection(from, pos, line.a, line.b).is_none() {
                break;
            }
            self.last_crossed_index = next;
            self.score += self.cfg.checkpoint_reward;
            self.since_progress = 0.0;
        }

        if car.corners().iter().all(|&c| !track.is_on_track(c)) {
            self.termination = Some(Termination::OffTrack);
        } else if self.since_progress + 1e-9 >= self.cfg.stall_timeout as f64 {
            self.termination = Some(Termination::Stalled);
        }
        Ok(self.termination.is_none())
    }

    pub fn get_score(&self) -> f32 {
        self.score
    }

    /// Zero the score, re-align with the start line and re-arm the stall timer.
    /// The car must already be back at its start position.
    pub fn reset_score(&mut self, car: &Car) {
        self.score = 0.0;
        self.last_crossed_index = self.start_last_index;
        self.since_progress = 0.0;
        self.termination = None;
        self.last_position = car.position();
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn last_crossed_index(&self) -> usize {
        self.last_crossed_index
    }

    pub fn next_index(&self) -> usize {
        (self.last_crossed_index + 1) % self.lines.len().max(1)
    }

    /// Checkpoint geometry for the renderer.
    pub fn lines(&self) -> &[Segment] {
        &self.lines
    }

    pub fn checkpoint_reward(&self) -> f32 {
        self.cfg.checkpoint_reward
    }
}
