pub mod car;
pub mod config;
pub mod db;
pub mod dqn;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod game;
pub mod log;
pub mod network;
pub mod replay_buffer;
pub mod track;
pub mod train;
pub mod utils;
pub mod web;
