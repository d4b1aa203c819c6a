//! Background training: one worker thread, one pass at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::dqn::Trainer;
use crate::error::TrainingFault;
use crate::log;

/// Size of each training pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig { batch_size: 1024, epochs: 10 }
    }
}

/// Outcome of one pass. `loss` is `None` for "not enough data" and for faults.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub loss: Option<f32>,
    pub duration: Duration,
}

struct TrainingRequest {
    batch_size: usize,
    epochs: usize,
}

pub struct TrainingWorker {
    requests: Option<Sender<TrainingRequest>>,
    reports: Receiver<TrainingReport>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TrainingWorker {
    pub fn spawn(trainer: Trainer) -> std::io::Result<Self> {
        Self::spawn_with(move |batch_size, epochs| trainer.run_pass(batch_size, epochs))
    }

    fn spawn_with<F>(pass: F) -> std::io::Result<Self>
    where
        F: Fn(usize, usize) -> Result<Option<f32>, TrainingFault> + Send + 'static,
    {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<TrainingRequest>();
        let (rep_tx, rep_rx) = crossbeam_channel::unbounded::<TrainingReport>();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);

        let handle = thread::Builder::new().name("trainer".into()).spawn(move || {
            for req in req_rx.iter() {
                let start = Instant::now();
                let loss = run_guarded(&pass, req.batch_size, req.epochs);
                worker_busy.store(false, Ordering::Release);
                let _ = rep_tx.send(TrainingReport { loss, duration: start.elapsed() });
            }
        })?;

        Ok(Self { requests: Some(req_tx), reports: rep_rx, busy, handle: Some(handle) })
    }

    /// Start a pass unless one is already running. Returns whether it started.
    pub fn try_submit(&self, batch_size: usize, epochs: usize) -> bool {
        let Some(tx) = &self.requests else {
            return false;
        };
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if tx.send(TrainingRequest { batch_size, epochs }).is_err() {
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Reports of passes finished since the last call. Never blocks.
    pub fn poll(&self) -> Vec<TrainingReport> {
        self.reports.try_iter().collect()
    }

    /// Stop accepting work and wait up to `timeout` for an in-flight pass.
    /// An idle worker is joined at once; a busy one that does not finish in
    /// time is detached.
    pub fn shutdown(mut self, timeout: Duration) -> WorkerShutdown {
        self.requests = None;
        let Some(handle) = self.handle.take() else {
            return WorkerShutdown { reports: self.poll(), joined: true };
        };
        if !self.is_busy() {
            // the thread is parked in recv and exits on the closed channel
            let _ = handle.join();
            return WorkerShutdown { reports: self.poll(), joined: true };
        }

        let deadline = Instant::now() + timeout;
        let mut reports = Vec::new();
        let finished = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reports.recv_timeout(remaining) {
                Ok(report) => reports.push(report),
                Err(RecvTimeoutError::Disconnected) => break true,
                Err(RecvTimeoutError::Timeout) => break false,
            }
        };
        if finished {
            let _ = handle.join();
        } else {
            log::warn(&format!(
                "training pass still running after {:.1}s; leaving it behind",
                timeout.as_secs_f32()
            ));
        }
        WorkerShutdown { reports, joined: finished }
    }
}

/// What `TrainingWorker::shutdown` collected.
#[derive(Debug)]
pub struct WorkerShutdown {
    pub reports: Vec<TrainingReport>,
    /// false when a pass was still running at the deadline
    pub joined: bool,
}

// Faults and panics stay on this thread; the caller only sees "no loss".
fn run_guarded<F>(pass: &F, batch_size: usize, epochs: usize) -> Option<f32>
where
    F: Fn(usize, usize) -> Result<Option<f32>, TrainingFault>,
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| pass(batch_size, epochs)));
    let fault = match result {
        Ok(Ok(loss)) => return loss,
        Ok(Err(fault)) => fault,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TrainingFault::Panicked(msg)
        }
    };
    log::error(&format!("background training failed: {fault}"));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReplayCache;
    use std::sync::atomic::AtomicUsize;
    use crate::dqn::{AgentConfig, DeepQDriver};

    fn agent_with_data(n: usize) -> DeepQDriver {
        let cfg = AgentConfig {
            accepted_sensors: 3,
            layer_count: 1,
            output_per_hidden: 8,
            seed: Some(3),
            ..AgentConfig::default()
        };
        let mut agent = DeepQDriver::new(cfg, ReplayCache::open_in_memory(None).unwrap());
        for i in 0..n {
            agent.remember(vec![0.25; 4], i % 9, 1.0, vec![0.5; 4], i % 2 == 0);
        }
        agent.dump_memory_to_cache().unwrap();
        agent
    }

    fn wait_for_report(worker: &TrainingWorker) -> TrainingReport {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(r) = worker.poll().pop() {
                return r;
            }
            assert!(Instant::now() < deadline, "no training report");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_pass_runs_in_background() {
        let agent = agent_with_data(16);
        let worker = TrainingWorker::spawn(agent.trainer()).unwrap();
        assert!(worker.try_submit(8, 2));
        let report = wait_for_report(&worker);
        assert!(report.loss.unwrap().is_finite());
        assert_eq!(agent.trainer().passes(), 1);
    }

    #[test]
    fn test_second_submit_is_skipped_while_busy() {
        let agent = agent_with_data(16);
        let trainer = agent.trainer();
        let worker = TrainingWorker::spawn(trainer.clone()).unwrap();

        let cache = trainer.cache();
        let guard = cache.lock();
        assert!(worker.try_submit(8, 1));
        assert!(worker.is_busy());
        assert!(!worker.try_submit(8, 1));
        drop(guard);

        assert!(wait_for_report(&worker).loss.is_some());
        assert!(!worker.is_busy());
        assert!(worker.try_submit(8, 1));
    }

    #[test]
    fn test_insufficient_data_reports_no_loss() {
        let agent = agent_with_data(4);
        let worker = TrainingWorker::spawn(agent.trainer()).unwrap();
        assert!(worker.try_submit(64, 1));
        assert_eq!(wait_for_report(&worker).loss, None);
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_pass() {
        let agent = agent_with_data(16);
        let worker = TrainingWorker::spawn(agent.trainer()).unwrap();
        assert!(worker.try_submit(16, 3));
        let done = worker.shutdown(Duration::from_secs(30));
        assert!(done.joined);
        assert_eq!(done.reports.len(), 1);
        assert!(done.reports[0].loss.is_some());
    }

    #[test]
    fn test_idle_worker_joins_without_waiting() {
        let worker = TrainingWorker::spawn(agent_with_data(4).trainer()).unwrap();
        let start = Instant::now();
        let done = worker.shutdown(Duration::ZERO);
        assert!(done.joined);
        assert!(done.reports.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_finished_report_survives_zero_timeout_shutdown() {
        let worker = TrainingWorker::spawn(agent_with_data(16).trainer()).unwrap();
        assert!(worker.try_submit(8, 1));
        let deadline = Instant::now() + Duration::from_secs(30);
        while worker.is_busy() {
            assert!(Instant::now() < deadline, "pass never finished");
            thread::sleep(Duration::from_millis(5));
        }
        let done = worker.shutdown(Duration::ZERO);
        assert!(done.joined);
        assert_eq!(done.reports.len(), 1);
    }

    #[test]
    fn test_panicking_pass_reports_no_loss_and_worker_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let worker = TrainingWorker::spawn_with(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("gradient blew up");
            }
            Ok(Some(1.0))
        })
        .unwrap();

        assert!(worker.try_submit(8, 1));
        assert_eq!(wait_for_report(&worker).loss, None);
        assert!(!worker.is_busy());

        assert!(worker.try_submit(8, 1));
        assert_eq!(wait_for_report(&worker).loss, Some(1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_training_fault_reports_no_loss() {
        let worker =
            TrainingWorker::spawn_with(|_, _| Err(TrainingFault::NonFiniteLoss(f32::INFINITY))).unwrap();
        assert!(worker.try_submit(8, 1));
        assert_eq!(wait_for_report(&worker).loss, None);
        assert!(worker.try_submit(8, 1));
    }
}
