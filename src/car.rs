//! Car kinematics and the distance-sensor sweep.

use serde::{Deserialize, Serialize};

use crate::error::SimulationFault;
use crate::track::Track;
use crate::utils::Vec2;

/// Physical limits and sensor geometry of the car.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarConfig {
    pub width: f32,
    pub height: f32,
    pub max_speed: f32,
    pub min_speed: f32,
    /// rad/s
    pub max_turn_rate: f32,
    pub max_acceleration: f32,
    /// Total forward arc covered by the sensors, radians.
    pub sensor_arc: f32,
    pub sensor_range: f32,
}

impl Default for CarConfig {
    fn default() -> Self {
        CarConfig {
            width: 24.0,
            height: 45.0,
            max_speed: 300.0,
            min_speed: 0.0,
            max_turn_rate: 3.0,
            max_acceleration: 200.0,
            sensor_arc: std::f32::consts::PI,
            sensor_range: 400.0,
        }
    }
}

/// The simulated vehicle. `height` runs along the heading, `width` across it.
#[derive(Debug, Clone)]
pub struct Car {
    cfg: CarConfig,
    position: Vec2,
    heading: Vec2,
    velocity: f32,
}

impl Car {
    pub fn new(cfg: CarConfig) -> Self {
        Self {
            cfg,
            position: Vec2::default(),
            heading: Vec2::new(1.0, 0.0),
            velocity: 0.0,
        }
    }

    /// Car with default limits and the given body size.
    pub fn with_size(width: f32, height: f32) -> Self {
        Self::new(CarConfig { width, height, ..CarConfig::default() })
    }

    /// Place the car at `point` facing `direction` and stop it.
    /// A zero direction keeps the previous heading.
    pub fn init_position(&mut self, point: Vec2, direction: Vec2) {
        self.position = point;
        if let Some(h) = direction.normalized() {
            self.heading = h;
        }
        self.velocity = self.cfg.min_speed.max(0.0).min(self.cfg.max_speed);
    }

    /// Integrate one tick.
    ///
    /// Turn and acceleration are clamped to the configured limits, velocity to
    /// `[min_speed, max_speed]`. Position follows the average of the old and new
    /// velocity vectors. A very large `dt` can carry the car through a wall in one
    /// step; nothing downstream relies on that being detected.
    pub fn advance(&mut self, turn_rate: f32, acceleration_rate: f32, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let turn = turn_rate.clamp(-self.cfg.max_turn_rate, self.cfg.max_turn_rate);
        let accel = acceleration_rate.clamp(-self.cfg.max_acceleration, self.cfg.max_acceleration);

        let old_velocity = self.heading * self.velocity;

        let rotated = self.heading.rotated(turn * dt);
        self.heading = rotated.normalized().unwrap_or(self.heading);
        self.velocity = (self.velocity + accel * dt).clamp(self.cfg.min_speed, self.cfg.max_speed);

        let new_velocity = self.heading * self.velocity;
        self.position = self.position + (old_velocity + new_velocity) * (0.5 * dt);
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn heading(&self) -> Vec2 {
        self.heading
    }

    /// Heading as an angle in radians, counter-clockwise from +x.
    pub fn angle(&self) -> f32 {
        self.heading.angle()
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    pub fn width(&self) -> f32 {
        self.cfg.width
    }

    pub fn height(&self) -> f32 {
        self.cfg.height
    }

    pub fn config(&self) -> &CarConfig {
        &self.cfg
    }

    pub fn max_turn_rate(&self) -> f32 {
        self.cfg.max_turn_rate
    }

    pub fn max_acceleration(&self) -> f32 {
        self.cfg.max_acceleration
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.heading.is_finite() && self.velocity.is_finite()
    }

    /// Body rectangle corners: front-left, front-right, rear-right, rear-left.
    pub fn corners(&self) -> [Vec2; 4] {
        let fwd = self.heading * (self.cfg.height * 0.5);
        let side = Vec2::new(-self.heading.y, self.heading.x) * (self.cfg.width * 0.5);
        let p = self.position;
        [p + fwd + side, p + fwd - side, p - fwd - side, p - fwd + side]
    }

    /// Ray angles relative to the heading: `count` rays spread evenly over the
    /// forward arc, ends included; one sensor looks straight ahead.
    pub fn sensor_angles(&self, count: usize) -> Vec<f32> {
        if count <= 1 {
            return vec![0.0; count];
        }
        let arc = self.cfg.sensor_arc;
        let step = arc / (count - 1) as f32;
        (0..count).map(|i| -arc * 0.5 + step * i as f32).collect()
    }

    /// Distances to the nearest boundary along each sensor ray, capped at
    /// `sensor_range`. Computed lazily from the current state on every call.
    pub fn sensors<'a>(
        &'a self,
        track: &'a Track,
        count: usize,
    ) -> Result<impl ExactSizeIterator<Item = f32> + 'a, SimulationFault> {
        if !self.is_finite() {
            return Err(SimulationFault::NonFiniteState { x: self.position.x, y: self.position.y });
        }
        if self.heading.normalized().is_none() {
            return Err(SimulationFault::DegenerateRay { x: self.position.x, y: self.position.y });
        }
        let origin = self.position;
        let range = self.cfg.sensor_range;
        let heading = self.heading;
        Ok(self
            .sensor_angles(count)
            .into_iter()
            .map(move |a| track.cast_ray(origin, heading.rotated(a), range)))
    }
}
