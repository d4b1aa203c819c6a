use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use warp::Filter;

use crate::game::EndReason;
use crate::log;

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeRecord {
    pub episode: u64,
    pub score: f32,
    pub epsilon: f32,
    pub ticks: u64,
    pub reason: EndReason,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LossRecord {
    pub pass: u64,
    pub loss: Option<f32>,
    pub duration_ms: u64,
}

/// Everything the stats endpoint serves.
#[derive(Debug, Default, Serialize)]
pub struct TrainingStats {
    episodes: Vec<EpisodeRecord>,
    losses: Vec<LossRecord>,
    best_score: Option<f32>,
}

impl TrainingStats {
    pub fn record_episode(&mut self, record: EpisodeRecord) {
        if self.best_score.is_none_or(|b| record.score > b) {
            self.best_score = Some(record.score);
        }
        self.episodes.push(record);
    }

    pub fn record_loss(&mut self, record: LossRecord) {
        self.losses.push(record);
    }

    pub fn latest(&self) -> Option<&EpisodeRecord> {
        self.episodes.last()
    }

    pub fn episodes(&self) -> &[EpisodeRecord] {
        &self.episodes
    }

    pub fn losses(&self) -> &[LossRecord] {
        &self.losses
    }

    pub fn best_score(&self) -> Option<f32> {
        self.best_score
    }
}

pub type SharedStats = Arc<Mutex<TrainingStats>>;

pub fn shared_stats() -> SharedStats {
    Arc::new(Mutex::new(TrainingStats::default()))
}

/// `GET /stats` (everything) and `GET /stats/latest` (last episode or null).
pub fn routes(
    stats: SharedStats,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let all_stats = Arc::clone(&stats);
    let all = warp::path!("stats")
        .and(warp::get())
        .map(move || warp::reply::json(&*all_stats.lock()));

    let latest = warp::path!("stats" / "latest")
        .and(warp::get())
        .map(move || warp::reply::json(&stats.lock().latest()));

    all.or(latest)
}

/// Serve the stats routes on 127.0.0.1:`port` from a dedicated thread.
pub fn spawn_stats_server(stats: SharedStats, port: u16) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("stats-http".into()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                log::error(&format!("stats server: cannot start runtime: {e}"));
                return;
            }
        };
        log::info(&format!("stats server on http://127.0.0.1:{port}/stats"));
        runtime.block_on(warp::serve(routes(stats)).run(([127, 0, 0, 1], port)));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(episode: u64, score: f32) -> EpisodeRecord {
        EpisodeRecord {
            episode,
            score,
            epsilon: 0.5,
            ticks: 100,
            reason: EndReason::OffTrack,
            finished_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_best_score_tracks_maximum() {
        let mut stats = TrainingStats::default();
        assert!(stats.latest().is_none());
        stats.record_episode(record(0, 2.0));
        stats.record_episode(record(1, 5.0));
        stats.record_episode(record(2, 1.0));
        assert_eq!(stats.best_score(), Some(5.0));
        assert_eq!(stats.latest().unwrap().episode, 2);
        assert_eq!(stats.episodes().len(), 3);
    }

    #[tokio::test]
    async fn test_latest_is_null_before_first_episode() {
        let stats = shared_stats();
        let res = warp::test::request().method("GET").path("/stats/latest").reply(&routes(stats)).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body().as_ref(), b"null");
    }

    #[tokio::test]
    async fn test_stats_json() {
        let stats = shared_stats();
        stats.lock().record_episode(record(4, 3.0));
        stats.lock().record_loss(LossRecord { pass: 1, loss: Some(0.25), duration_ms: 12 });
        let filter = routes(Arc::clone(&stats));

        let res = warp::test::request().method("GET").path("/stats").reply(&filter).await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["episodes"][0]["episode"], 4);
        assert_eq!(body["episodes"][0]["reason"], "OffTrack");
        assert_eq!(body["losses"][0]["loss"], 0.25);
        assert_eq!(body["best_score"], 3.0);

        let res = warp::test::request().method("GET").path("/stats/latest").reply(&filter).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["score"], 3.0);
    }
}
