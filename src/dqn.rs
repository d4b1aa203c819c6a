/// DQN driver: epsilon-greedy policy, episode memory, durable replay, training, save/load

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::car::Car;
use crate::db::{ModelCheckpoint, ModelMetadata, ReplayCache, load_checkpoint, save_checkpoint};
use crate::driver::{Command, DriveMode, Driver};
use crate::error::{CacheError, ModelLoadError, SimulationFault, TrainingFault};
use crate::log;
use crate::network::{Adam, Architecture, QNetwork, Sample};
use crate::replay_buffer::{EpisodeMemory, Transition};
use crate::track::Track;
use crate::utils::{argmax, has_non_finite, vec_stats};

/// (turn, acceleration) multipliers of the discrete actions.
/// Index = turn_index * 3 + accel_index.
pub const ACTIONS: [(f32, f32); 9] = [
    (-1.0, -1.0), (-1.0, 0.0), (-1.0, 1.0),
    (0.0, -1.0),  (0.0, 0.0),  (0.0, 1.0),
    (1.0, -1.0),  (1.0, 0.0),  (1.0, 1.0),
];
pub const ACTION_COUNT: usize = ACTIONS.len();

/// Hyperparameters for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub accepted_sensors: usize,      // sensor rays in the state vector
    pub layer_count: usize,           // hidden layers
    pub output_per_hidden: usize,     // hidden width
    pub gamma: f32,                   // discount factor
    pub epsilon: f32,                 // initial exploration rate
    pub epsilon_decay: f32,           // multiplicative decay per episode
    pub epsilon_min: f32,
    pub learning_rate: f32,
    pub regulation_rate: f32,         // L2 strength
    pub cache_capacity: Option<usize>, // rows kept in the replay cache
    pub seed: Option<u64>,            // exploration + init RNG
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            accepted_sensors: 10,
            layer_count: 8,
            output_per_hidden: 32,
            gamma: 0.99,
            epsilon: 0.8,
            epsilon_decay: 0.99,
            epsilon_min: 0.1,
            learning_rate: 0.01,
            regulation_rate: 0.0,
            cache_capacity: None,
            seed: None,
        }
    }
}

impl AgentConfig {
    pub fn architecture(&self) -> Architecture {
        Architecture {
            inputs: self.accepted_sensors + 1,
            hidden_layers: self.layer_count,
            hidden_width: self.output_per_hidden,
            outputs: ACTION_COUNT,
        }
    }
}

/// The live parameter set. Readers take a cheap `Arc` snapshot; training
/// publishes a complete replacement, so inference never sees a half-updated net.
#[derive(Clone)]
pub struct PolicyCell {
    inner: Arc<RwLock<Arc<QNetwork>>>,
}

impl PolicyCell {
    pub fn new(net: QNetwork) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(net))) }
    }

    pub fn snapshot(&self) -> Arc<QNetwork> {
        Arc::clone(&self.inner.read())
    }

    pub fn publish(&self, net: QNetwork) {
        *self.inner.write() = Arc::new(net);
    }
}

/// Everything a training pass needs; cheap to clone and `Send`, so a pass can
/// run on the worker thread while the driver keeps acting.
#[derive(Clone)]
pub struct Trainer {
    policy: PolicyCell,
    optimizer: Arc<Mutex<Adam>>, // held for the whole pass: one pass at a time
    cache: Arc<Mutex<ReplayCache>>,
    gamma: f32,
    regulation_rate: f32,
    passes: Arc<AtomicU64>,
}

impl Trainer {
    pub fn policy(&self) -> &PolicyCell {
        &self.policy
    }

    pub fn cache(&self) -> Arc<Mutex<ReplayCache>> {
        Arc::clone(&self.cache)
    }

    /// Completed passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Swap in new parameters and forget the optimizer moments.
    /// Waits for a running pass to finish first.
    fn install(&self, net: QNetwork) {
        let mut opt = self.optimizer.lock();
        opt.reset(&net);
        self.policy.publish(net);
    }

    /// One training pass: sample `batch_size` transitions, build Bellman targets
    /// from the parameters published at the start of the pass, take `epochs`
    /// Adam steps on a private copy, then publish it.
    ///
    /// The returned loss is measured on the published parameters.
    /// `Ok(None)` when the cache holds fewer than `batch_size` transitions.
    pub fn run_pass(&self, batch_size: usize, epochs: usize) -> Result<Option<f32>, TrainingFault> {
        if batch_size == 0 || epochs == 0 {
            return Ok(None);
        }
        let mut optimizer = self.optimizer.lock();

        let batch = {
            let cache = self.cache.lock();
            let available = cache.len()?;
            if available < batch_size {
                log::debug(&format!("replay: {available} transitions cached, need {batch_size}"));
                return Ok(None);
            }
            cache.sample(batch_size)?
        };

        let frozen = self.policy.snapshot();
        let arch = frozen.architecture();
        let gamma = self.gamma;

        // targets: r + gamma * max_a' Q(s', a') * (1 - done)
        let targets: Vec<Option<f32>> = batch
            .par_iter()
            .map(|t| {
                if t.state.len() != arch.inputs || t.next_state.len() != arch.inputs || t.action >= arch.outputs {
                    return None;
                }
                if t.done {
                    return Some(t.reward);
                }
                let next_q = frozen.forward(&t.next_state);
                if has_non_finite(&next_q) {
                    return None;
                }
                Some(t.reward + gamma * next_q[argmax(&next_q)])
            })
            .collect();

        let samples: Vec<Sample<'_>> = batch
            .iter()
            .zip(&targets)
            .filter_map(|(t, y)| y.map(|target| Sample { state: &t.state, action: t.action, target }))
            .collect();
        if samples.len() < batch.len() {
            log::warn(&format!(
                "replay: skipped {} malformed or non-finite transitions",
                batch.len() - samples.len()
            ));
        }
        if samples.is_empty() {
            return Ok(None);
        }

        let mut net = (*frozen).clone();
        for _ in 0..epochs {
            let (l, grads) = net.loss_and_gradients(&samples, self.regulation_rate);
            if !l.is_finite() {
                return Err(TrainingFault::NonFiniteLoss(l));
            }
            optimizer.step(&mut net, &grads);
        }
        let loss = net.loss(&samples, self.regulation_rate);
        if !loss.is_finite() || !net.parameters_finite() {
            return Err(TrainingFault::NonFiniteLoss(loss));
        }
        self.policy.publish(net);
        drop(optimizer);

        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let ys: Vec<f32> = samples.iter().map(|s| s.target).collect();
        let ys = vec_stats(&ys);
        log::scalar(pass, "loss", loss);
        log::scalar(pass, "target_mean", ys.mean);
        log::scalar(pass, "target_max", ys.max);
        Ok(Some(loss))
    }
}

/// Deep Q-learning driver.
pub struct DeepQDriver {
    cfg: AgentConfig,
    arch: Architecture,
    epsilon: f32,
    memory: EpisodeMemory,
    episode: u64,               // episode number stamped on the next dump
    rng: Box<dyn RngCore + Send>,
    trainer: Trainer,
}

impl DeepQDriver {
    /// Fresh parameters; RNG seeded from `cfg.seed` or from entropy.
    pub fn new(cfg: AgentConfig, cache: ReplayCache) -> Self {
        let rng: Box<dyn RngCore + Send> = match cfg.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_entropy()),
        };
        Self::build(cfg, cache, rng)
    }

    /// Same as `new` but every random draw comes from `rng`.
    pub fn with_rng<R: RngCore + Send + 'static>(cfg: AgentConfig, cache: ReplayCache, rng: R) -> Self {
        Self::build(cfg, cache, Box::new(rng))
    }

    fn build(cfg: AgentConfig, cache: ReplayCache, mut rng: Box<dyn RngCore + Send>) -> Self {
        let arch = cfg.architecture();
        let net = QNetwork::new(arch, &mut *rng);
        let optimizer = Adam::new(&net, cfg.learning_rate);
        let episode = match cache.last_episode() {
            Ok(last) => last.map_or(0, |e| e + 1),
            Err(e) => {
                log::warn(&format!("replay cache: cannot read last episode: {e}"));
                0
            }
        };
        let trainer = Trainer {
            policy: PolicyCell::new(net),
            optimizer: Arc::new(Mutex::new(optimizer)),
            cache: Arc::new(Mutex::new(cache)),
            gamma: cfg.gamma,
            regulation_rate: cfg.regulation_rate,
            passes: Arc::new(AtomicU64::new(0)),
        };
        Self {
            epsilon: cfg.epsilon.clamp(0.0, 1.0),
            cfg,
            arch,
            memory: EpisodeMemory::new(),
            episode,
            rng,
            trainer,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Handle for running passes off this thread.
    pub fn trainer(&self) -> Trainer {
        self.trainer.clone()
    }

    /// Normalized sensor distances followed by normalized velocity.
    pub fn get_input_data(&self, car: &Car, track: &Track) -> Result<Vec<f32>, SimulationFault> {
        let range = car.config().sensor_range.max(f32::EPSILON);
        let mut state = Vec::with_capacity(self.arch.inputs);
        state.extend(car.sensors(track, self.cfg.accepted_sensors)?.map(|d| d / range));
        state.push(car.velocity() / car.config().max_speed.max(f32::EPSILON));
        Ok(state)
    }

    /// Epsilon-greedy choice for the current car state.
    /// Returns `(turn_rate, acceleration_rate, action_index)`.
    pub fn calculate_command(
        &mut self,
        car: &Car,
        track: &Track,
        training: bool,
    ) -> Result<(f32, f32, usize), SimulationFault> {
        let state = self.get_input_data(car, track)?;
        self.command_for_state(&state, car, training)
    }

    /// `calculate_command` on an already observed state.
    pub fn command_for_state(
        &mut self,
        state: &[f32],
        car: &Car,
        training: bool,
    ) -> Result<(f32, f32, usize), SimulationFault> {
        let action = self.select_action(state, training)?;
        let (turn, accel) = ACTIONS[action];
        Ok((turn * car.max_turn_rate(), accel * car.max_acceleration(), action))
    }

    fn select_action(&mut self, state: &[f32], training: bool) -> Result<usize, SimulationFault> {
        if state.len() != self.arch.inputs {
            return Err(SimulationFault::StateShape { expected: self.arch.inputs, found: state.len() });
        }
        if training && self.rng.r#gen::<f32>() < self.epsilon {
            return Ok(self.rng.gen_range(0..ACTION_COUNT));
        }
        let q = self.trainer.policy.snapshot().forward(state);
        if has_non_finite(&q) {
            log::error("Q contains NaN/Inf in select_action, falling back to random action");
            return Ok(self.rng.gen_range(0..ACTION_COUNT));
        }
        Ok(argmax(&q))
    }

    /// Store transition in episode memory. Transitions carrying NaN or
    /// infinity are dropped, since the cache cannot hold them.
    pub fn remember(&mut self, state: Vec<f32>, action: usize, reward: f32, next_state: Vec<f32>, done: bool) {
        if !reward.is_finite() || has_non_finite(&state) || has_non_finite(&next_state) {
            log::warn(&format!("dropping non-finite transition (action {action}, reward {reward})"));
            return;
        }
        self.memory.push(Transition { state, action, reward, next_state, done });
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn clear_memory(&mut self) {
        self.memory.clear();
    }

    /// Append episode memory to the replay cache. Memory is cleared only once
    /// the write has committed; on error it is kept for the next attempt.
    pub fn dump_memory_to_cache(&mut self) -> Result<usize, CacheError> {
        if self.memory.is_empty() {
            return Ok(0);
        }
        let written = self.trainer.cache.lock().append(self.episode, self.memory.as_slice())?;
        self.memory.clear();
        log::debug(&format!("episode {}: dumped {written} transitions", self.episode));
        self.episode += 1;
        Ok(written)
    }

    /// Synchronous training pass. Faults are logged and reported as `None`.
    pub fn replay_memory(&self, batch_size: usize, epochs: usize) -> Option<f32> {
        match self.trainer.run_pass(batch_size, epochs) {
            Ok(loss) => loss,
            Err(fault) => {
                log::error(&format!("training pass failed: {fault}"));
                None
            }
        }
    }

    pub fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * self.cfg.epsilon_decay).max(self.cfg.epsilon_min);
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f32) {
        self.epsilon = epsilon.clamp(0.0, 1.0);
    }

    /// Write the current parameters and epsilon as a JSON checkpoint.
    pub fn save_model_weights(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let checkpoint = ModelCheckpoint {
            meta: ModelMetadata {
                epsilon: self.epsilon,
                saved_at: chrono::Local::now().to_rfc3339(),
            },
            model: (*self.trainer.policy.snapshot()).clone(),
        };
        save_checkpoint(path, &checkpoint)?;
        log::info(&format!("saved model to {}", path.display()));
        Ok(())
    }

    /// Restore parameters from a checkpoint. Epsilon is left as configured.
    pub fn load_model_weights(&mut self, path: &Path) -> Result<(), ModelLoadError> {
        let checkpoint = load_checkpoint(path)?;
        let found = checkpoint.model.architecture();
        if found != self.arch || !checkpoint.model.is_consistent() {
            return Err(ModelLoadError::ArchitectureMismatch {
                expected: self.arch.to_string(),
                found: found.to_string(),
            });
        }
        self.trainer.install(checkpoint.model);
        log::info(&format!(
            "loaded model from {} (saved {}, epsilon {:.3})",
            path.display(),
            checkpoint.meta.saved_at,
            checkpoint.meta.epsilon
        ));
        Ok(())
    }
}

impl Driver for DeepQDriver {
    fn command(&mut self, car: &Car, track: &Track, mode: DriveMode) -> Result<Command, SimulationFault> {
        let (turn_rate, acceleration_rate, action) =
            self.calculate_command(car, track, mode == DriveMode::Training)?;
        Ok(Command { turn_rate, acceleration_rate, action: Some(action) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::CarConfig;
    use crate::track::tests::square_track;
    use rand::rngs::mock::StepRng;

    fn small_config() -> AgentConfig {
        AgentConfig {
            accepted_sensors: 5,
            layer_count: 2,
            output_per_hidden: 8,
            seed: Some(7),
            ..AgentConfig::default()
        }
    }

    fn agent(cfg: AgentConfig) -> DeepQDriver {
        DeepQDriver::new(cfg, ReplayCache::open_in_memory(None).unwrap())
    }

    fn placed_car() -> (Car, Track) {
        let track = square_track();
        let mut car = Car::new(CarConfig::default());
        car.init_position(track.start_point, track.start_direction);
        (car, track)
    }

    #[test]
    fn test_action_table_layout() {
        assert_eq!(ACTION_COUNT, 9);
        assert_eq!(ACTIONS[4], (0.0, 0.0));
        assert_eq!(ACTIONS[2], (-1.0, 1.0));
        assert_eq!(ACTIONS[6], (1.0, -1.0));
    }

    #[test]
    fn test_input_data_shape_and_range() {
        let (car, track) = placed_car();
        let agent = agent(small_config());
        let state = agent.get_input_data(&car, &track).unwrap();
        assert_eq!(state.len(), 6);
        assert!(state.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(state[5], 0.0);
    }

    #[test]
    fn test_zero_draw_explores_high_draw_exploits() {
        let (car, track) = placed_car();
        let mut greedy = agent(small_config());
        let (_, _, expected) = greedy.calculate_command(&car, &track, false).unwrap();

        let cache = ReplayCache::open_in_memory(None).unwrap();
        let mut high = DeepQDriver::with_rng(small_config(), cache, StepRng::new(u64::MAX, 0));
        high.trainer.install((*greedy.trainer.policy.snapshot()).clone());
        high.set_epsilon(0.5);
        let (_, _, a) = high.calculate_command(&car, &track, true).unwrap();
        assert_eq!(a, expected);

        let cache = ReplayCache::open_in_memory(None).unwrap();
        let mut low = DeepQDriver::with_rng(small_config(), cache, StepRng::new(0, 0));
        low.set_epsilon(0.5);
        let (turn, accel, a) = low.calculate_command(&car, &track, true).unwrap();
        assert_eq!(a, 0);
        assert_eq!(turn, -car.max_turn_rate());
        assert_eq!(accel, -car.max_acceleration());
    }

    #[test]
    fn test_zero_epsilon_is_deterministic() {
        let (car, track) = placed_car();
        let mut cfg = small_config();
        cfg.epsilon = 0.0;
        let mut a = agent(cfg);
        let first = a.calculate_command(&car, &track, true).unwrap();
        for _ in 0..20 {
            assert_eq!(a.calculate_command(&car, &track, true).unwrap(), first);
        }
    }

    #[test]
    fn test_wrong_state_length_is_a_fault() {
        let (car, _) = placed_car();
        let mut a = agent(small_config());
        let err = a.command_for_state(&[0.0; 3], &car, false).unwrap_err();
        assert_eq!(err, SimulationFault::StateShape { expected: 6, found: 3 });
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let mut a = agent(small_config());
        assert_eq!(a.epsilon(), 0.8);
        a.decay_epsilon();
        assert!((a.epsilon() - 0.792).abs() < 1e-6);
        for _ in 0..1000 {
            a.decay_epsilon();
            assert!(a.epsilon() >= 0.1);
        }
        assert_eq!(a.epsilon(), 0.1);
    }

    #[test]
    fn test_dump_clears_memory_and_stamps_episodes() {
        let mut a = agent(small_config());
        assert_eq!(a.dump_memory_to_cache().unwrap(), 0);
        for i in 0..4 {
            a.remember(vec![0.1; 6], i, 1.0, vec![0.2; 6], i == 3);
        }
        assert_eq!(a.memory_len(), 4);
        assert_eq!(a.dump_memory_to_cache().unwrap(), 4);
        assert_eq!(a.memory_len(), 0);
        let cache = a.trainer().cache();
        let cache = cache.lock();
        assert_eq!(cache.len().unwrap(), 4);
        assert_eq!(cache.last_episode().unwrap(), Some(0));
    }

    #[test]
    fn test_replay_needs_a_full_batch() {
        let mut a = agent(small_config());
        assert_eq!(a.replay_memory(8, 1), None);
        for i in 0..16 {
            a.remember(vec![0.05 * i as f32; 6], i % ACTION_COUNT, 0.5, vec![0.1; 6], i % 5 == 0);
        }
        a.dump_memory_to_cache().unwrap();
        assert_eq!(a.replay_memory(32, 1), None);
        let loss = a.replay_memory(8, 3).unwrap();
        assert!(loss.is_finite());
        assert_eq!(a.trainer().passes(), 1);
    }

    #[test]
    fn test_training_publishes_new_parameters() {
        let mut a = agent(small_config());
        for i in 0..10 {
            a.remember(vec![0.3; 6], i % ACTION_COUNT, 5.0, vec![0.3; 6], true);
        }
        a.dump_memory_to_cache().unwrap();
        let before = a.trainer().policy().snapshot();
        a.replay_memory(10, 2).unwrap();
        let after = a.trainer().policy().snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_ne!(*before, *after);
    }

    #[test]
    fn test_non_finite_transitions_are_dropped() {
        let mut a = agent(small_config());
        a.remember(vec![0.1; 6], 0, f32::NAN, vec![0.2; 6], true);
        a.remember(vec![f32::INFINITY; 6], 1, 1.0, vec![0.2; 6], false);
        assert_eq!(a.memory_len(), 0);

        for episode in 0..3 {
            for i in 0..5 {
                a.remember(vec![0.1; 6], i, 1.0, vec![0.2; 6], false);
            }
            a.remember(vec![0.1; 6], 0, f32::NAN, vec![0.2; 6], true);
            assert_eq!(a.dump_memory_to_cache().unwrap(), 5);
            assert_eq!(a.memory_len(), 0);
            assert_eq!(a.trainer().cache().lock().last_episode().unwrap(), Some(episode));
        }
        assert_eq!(a.trainer().cache().lock().len().unwrap(), 15);
    }

    #[test]
    fn test_overflowing_loss_keeps_published_policy() {
        let mut a = agent(small_config());
        for i in 0..8 {
            a.remember(vec![0.3; 6], i % ACTION_COUNT, f32::MAX, vec![0.3; 6], true);
        }
        a.dump_memory_to_cache().unwrap();
        let before = a.trainer().policy().snapshot();
        assert_eq!(a.replay_memory(8, 2), None);
        let after = a.trainer().policy().snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(a.trainer().passes(), 0);
    }

    #[test]
    fn test_reported_loss_is_for_published_parameters() {
        let mut a = agent(small_config());
        for _ in 0..8 {
            a.remember(vec![0.3; 6], 2, 5.0, vec![0.3; 6], true);
        }
        a.dump_memory_to_cache().unwrap();
        let before = a.trainer().policy().snapshot();
        let loss = a.replay_memory(8, 3).unwrap();

        let state = [0.3; 6];
        let samples = [Sample { state: &state, action: 2, target: 5.0 }];
        let published = a.trainer().policy().snapshot();
        let expected = published.loss(&samples, a.config().regulation_rate);
        assert!((loss - expected).abs() <= 1e-4 * expected.max(1.0));
        assert!(loss < before.loss(&samples, a.config().regulation_rate));
    }

    #[test]
    fn test_load_rejects_other_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        agent(small_config()).save_model_weights(&path).unwrap();

        let mut other = agent(AgentConfig { output_per_hidden: 4, ..small_config() });
        assert!(matches!(
            other.load_model_weights(&path),
            Err(ModelLoadError::ArchitectureMismatch { .. })
        ));
    }
}
