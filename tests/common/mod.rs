#![allow(dead_code)]

use self_driving_car::car::{Car, CarConfig};
use self_driving_car::db::ReplayCache;
use self_driving_car::dqn::{AgentConfig, DeepQDriver};
use self_driving_car::evaluator::{EvaluatorConfig, LineEvaluator};
use self_driving_car::track::Track;
use self_driving_car::utils::{Segment, Vec2};

/// 400x400 square loop with a 100 wide corridor, start on the bottom straight.
pub fn square_track() -> Track {
    Track::new(
        vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(400.0, 0.0),
            Vec2::new(400.0, 400.0),
            Vec2::new(0.0, 400.0),
        ],
        vec![
            Vec2::new(100.0, 100.0),
            Vec2::new(300.0, 100.0),
            Vec2::new(300.0, 300.0),
            Vec2::new(100.0, 300.0),
        ],
        Vec2::new(200.0, 50.0),
        Vec2::new(1.0, 0.0),
    )
    .unwrap()
}

/// One line across each side of the square, counter-clockwise from the start.
pub fn square_lines() -> Vec<Segment> {
    vec![
        Segment::new(Vec2::new(200.0, 0.0), Vec2::new(200.0, 100.0)),
        Segment::new(Vec2::new(300.0, 200.0), Vec2::new(400.0, 200.0)),
        Segment::new(Vec2::new(200.0, 300.0), Vec2::new(200.0, 400.0)),
        Segment::new(Vec2::new(0.0, 200.0), Vec2::new(100.0, 200.0)),
    ]
}

pub fn car_at_start(track: &Track) -> Car {
    let mut car = Car::new(CarConfig::default());
    car.init_position(track.start_point, track.start_direction);
    car
}

pub fn evaluator(car: &Car, track: &Track) -> LineEvaluator {
    LineEvaluator::new(EvaluatorConfig::default(), square_lines(), car, track)
}

pub fn small_agent_config(seed: u64) -> AgentConfig {
    AgentConfig {
        accepted_sensors: 5,
        layer_count: 2,
        output_per_hidden: 16,
        seed: Some(seed),
        ..AgentConfig::default()
    }
}

pub fn small_agent(seed: u64) -> DeepQDriver {
    DeepQDriver::new(small_agent_config(seed), ReplayCache::open_in_memory(None).unwrap())
}
