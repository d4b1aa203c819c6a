//! Who is at the wheel: the learning agent or a human.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::car::Car;
use crate::error::SimulationFault;
use crate::track::Track;

/// Continuous control for one tick. `action` is the discrete action index
/// when the command came from the agent's action table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub turn_rate: f32,
    pub acceleration_rate: f32,
    pub action: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Exploration allowed.
    Training,
    /// Greedy only.
    Evaluation,
}

/// Anything that can produce a command from the current car and track.
pub trait Driver {
    fn command(&mut self, car: &Car, track: &Track, mode: DriveMode) -> Result<Command, SimulationFault>;
}

/// Held-key state written by the input layer, read by `PlayerDriver`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlayerInput {
    pub left: bool,
    pub right: bool,
    pub accelerate: bool,
    pub brake: bool,
}

/// Human override: maps held keys to full turn / acceleration.
#[derive(Debug, Clone, Default)]
pub struct PlayerDriver {
    input: Arc<Mutex<PlayerInput>>,
}

impl PlayerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the input layer; shares state with this driver.
    pub fn input(&self) -> Arc<Mutex<PlayerInput>> {
        Arc::clone(&self.input)
    }
}

fn axis(negative: bool, positive: bool) -> f32 {
    match (negative, positive) {
        (true, false) => -1.0,
        (false, true) => 1.0,
        _ => 0.0,
    }
}

impl Driver for PlayerDriver {
    fn command(&mut self, car: &Car, _track: &Track, _mode: DriveMode) -> Result<Command, SimulationFault> {
        let keys = *self.input.lock();
        // left is counter-clockwise (positive angle)
        Ok(Command {
            turn_rate: axis(keys.right, keys.left) * car.max_turn_rate(),
            acceleration_rate: axis(keys.brake, keys.accelerate) * car.max_acceleration(),
            action: None,
        })
    }
}
