//! Durable storage: the SQLite replay cache and the JSON model checkpoint.

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{CacheError, ModelLoadError};
use crate::network::QNetwork;
use crate::replay_buffer::Transition;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelMetadata {
    pub epsilon: f32,
    pub saved_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelCheckpoint {
    pub meta: ModelMetadata,
    pub model: QNetwork,
}

/// Write the checkpoint next to `path` and rename it into place.
pub fn save_checkpoint(path: &Path, checkpoint: &ModelCheckpoint) -> std::io::Result<()> {
    let json = serde_json::to_string(checkpoint).map_err(std::io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

pub fn load_checkpoint(path: &Path) -> Result<ModelCheckpoint, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ModelLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Append-only store of transitions, read back in random batches for training.
pub struct ReplayCache {
    conn: Connection,
    capacity: Option<usize>,
}

impl ReplayCache {
    pub fn open(path: &Path, capacity: Option<usize>) -> Result<Self, CacheError> {
        Self::init(Connection::open(path)?, capacity)
    }

    pub fn open_in_memory(capacity: Option<usize>) -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?, capacity)
    }

    fn init(conn: Connection, capacity: Option<usize>) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode INTEGER NOT NULL,
                state TEXT NOT NULL,
                action INTEGER NOT NULL,
                reward REAL NOT NULL,
                next_state TEXT NOT NULL,
                done INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn, capacity })
    }

    /// Store `batch` in one transaction; returns the number of rows written.
    /// Oldest rows beyond `capacity` are dropped afterwards.
    pub fn append(&mut self, episode: u64, batch: &[Transition]) -> Result<usize, CacheError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transitions (episode, state, action, reward, next_state, done, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for t in batch {
                stmt.execute(params![
                    episode as i64,
                    serde_json::to_string(&t.state)?,
                    t.action as i64,
                    t.reward as f64,
                    serde_json::to_string(&t.next_state)?,
                    t.done,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        if let Some(cap) = self.capacity {
            self.conn.execute(
                "DELETE FROM transitions WHERE id NOT IN
                 (SELECT id FROM transitions ORDER BY id DESC LIMIT ?1)",
                params![cap as i64],
            )?;
        }
        Ok(batch.len())
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM transitions", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Up to `n` distinct transitions drawn uniformly (without replacement).
    pub fn sample(&self, n: usize) -> Result<Vec<Transition>, CacheError> {
        let mut stmt = self.conn.prepare(
            "SELECT state, action, reward, next_state, done FROM transitions
             ORDER BY RANDOM() LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, bool>(4)?,
            ))
        })?;

        let mut out = Vec::with_capacity(n);
        for row in rows {
            let (state, action, reward, next_state, done) = row?;
            out.push(Transition {
                state: serde_json::from_str(&state)?,
                action: action as usize,
                reward: reward as f32,
                next_state: serde_json::from_str(&next_state)?,
                done,
            });
        }
        Ok(out)
    }

    /// Highest episode number stored, if any.
    pub fn last_episode(&self) -> Result<Option<u64>, CacheError> {
        let e: Option<i64> = self
            .conn
            .query_row("SELECT MAX(episode) FROM transitions", [], |r| r.get(0))?;
        Ok(e.map(|v| v as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Architecture;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn transition(i: usize) -> Transition {
        Transition {
            state: vec![i as f32, 0.5],
            action: i % 3,
            reward: i as f32 * 0.1,
            next_state: vec![i as f32 + 1.0, 0.5],
            done: i % 4 == 3,
        }
    }

    #[test]
    fn test_append_and_sample_without_replacement() {
        let mut cache = ReplayCache::open_in_memory(None).unwrap();
        assert!(cache.is_empty().unwrap());
        let batch: Vec<Transition> = (0..10).map(transition).collect();
        assert_eq!(cache.append(0, &batch).unwrap(), 10);
        assert_eq!(cache.append(1, &[]).unwrap(), 0);
        assert_eq!(cache.len().unwrap(), 10);

        let sample = cache.sample(10).unwrap();
        assert_eq!(sample.len(), 10);
        let mut firsts: Vec<i32> = sample.iter().map(|t| t.state[0] as i32).collect();
        firsts.sort();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());
        assert!(sample.iter().all(|t| batch.contains(t)));

        assert_eq!(cache.sample(50).unwrap().len(), 10);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut cache = ReplayCache::open_in_memory(Some(5)).unwrap();
        let batch: Vec<Transition> = (0..8).map(transition).collect();
        cache.append(3, &batch).unwrap();
        assert_eq!(cache.len().unwrap(), 5);
        let mut firsts: Vec<i32> = cache.sample(5).unwrap().iter().map(|t| t.state[0] as i32).collect();
        firsts.sort();
        assert_eq!(firsts, vec![3, 4, 5, 6, 7]);
        assert_eq!(cache.last_episode().unwrap(), Some(3));
    }

    #[test]
    fn test_cache_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.db");
        {
            let mut cache = ReplayCache::open(&path, None).unwrap();
            cache.append(0, &[transition(1), transition(2)]).unwrap();
        }
        let mut cache = ReplayCache::open(&path, None).unwrap();
        cache.append(1, &[transition(3)]).unwrap();
        assert_eq!(cache.len().unwrap(), 3);
    }

    #[test]
    fn test_checkpoint_round_trip_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let arch = Architecture { inputs: 2, hidden_layers: 1, hidden_width: 4, outputs: 3 };
        let model = QNetwork::new(arch, &mut StdRng::seed_from_u64(5));
        let ckpt = ModelCheckpoint {
            meta: ModelMetadata { epsilon: 0.3, saved_at: "now".into() },
            model,
        };
        save_checkpoint(&path, &ckpt).unwrap();
        let back = load_checkpoint(&path).unwrap();
        assert_eq!(back.model.architecture(), arch);
        assert_eq!(back.meta.epsilon, 0.3);

        assert!(matches!(
            load_checkpoint(&dir.path().join("missing.json")),
            Err(ModelLoadError::NotFound(_))
        ));
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_checkpoint(&path), Err(ModelLoadError::Parse { .. })));
    }
}
