//! Best-effort snapshot file for the game state.
//!
//! Mutations arm a single delayed write; further mutations while it is armed
//! are folded into it. The write always serializes whatever the state is when
//! the timer fires. Failures are logged and otherwise ignored.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use game_core::GameState;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

pub struct Persister {
    path: PathBuf,
    debounce: Duration,
    game: Arc<RwLock<GameState>>,
    armed: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    pub fn new(
        path: impl Into<PathBuf>,
        debounce: Duration,
        game: Arc<RwLock<GameState>>,
    ) -> Self {
        Self {
            path: path.into(),
            debounce,
            game,
            armed: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) async fn is_armed(&self) -> bool {
        self.armed.lock().await.is_some()
    }

    /// Arms the delayed write unless one is already pending.
    pub async fn schedule(self: &Arc<Self>) {
        let mut armed = self.armed.lock().await;
        if armed.is_some() {
            return;
        }
        let persister = Arc::clone(self);
        *armed = Some(tokio::spawn(async move {
            sleep(persister.debounce).await;
            persister.armed.lock().await.take();
            persister.write().await;
        }));
    }

    /// Cancels a pending write and writes the current state right away.
    pub async fn flush(&self) {
        if let Some(pending) = self.armed.lock().await.take() {
            pending.abort();
        }
        self.write().await;
    }

    async fn write(&self) {
        let encoded = {
            let game = self.game.read().await;
            serde_json::to_vec_pretty(&*game)
        };
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to serialize game state");
                return;
            }
        };
        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => debug!(path = %self.path.display(), "game state persisted"),
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to persist game state"
            ),
        }
    }
}

/// Reads the snapshot file, falling back to an empty game on any problem.
pub async fn load(path: &Path) -> GameState {
    let mut state = GameState::default();
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(doc) => {
                state.restore(&doc);
                info!(
                    path = %path.display(),
                    players = state.assignments.len(),
                    "restored game state from snapshot"
                );
            }
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "snapshot is not valid JSON; starting empty"
            ),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot found; starting empty");
        }
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "failed to read snapshot; starting empty"
        ),
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_core::{Scores, Team};
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("ctf_state_{}.json", Uuid::new_v4()))
    }

    fn persister(path: &Path) -> (Arc<Persister>, Arc<RwLock<GameState>>) {
        let game = Arc::new(RwLock::new(GameState::default()));
        let persister = Arc::new(Persister::new(path, DEFAULT_DEBOUNCE, game.clone()));
        (persister, game)
    }

    #[tokio::test]
    async fn burst_of_schedules_produces_one_delayed_write() {
        let path = temp_path();
        let (persister, game) = persister(&path);
        game.write().await.assign("u1", "red").unwrap();

        persister.schedule().await;
        persister.schedule().await;
        persister.schedule().await;
        assert!(persister.is_armed().await);
        assert!(tokio::fs::metadata(&path).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!persister.is_armed().await);

        let restored = load(&path).await;
        assert_eq!(restored.assignments.get("u1"), Some(&Team::Red));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn write_captures_state_at_fire_time() {
        let path = temp_path();
        let (persister, game) = persister(&path);

        persister.schedule().await;
        game.write().await.apply_score("blue", 4).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let restored = load(&path).await;
        assert_eq!(restored.scores, Scores { red: 0, blue: 4 });
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn rearms_after_a_write_fires() {
        let path = temp_path();
        let (persister, game) = persister(&path);

        persister.schedule().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        game.write().await.assign("late", "blue").unwrap();
        persister.schedule().await;
        assert!(persister.is_armed().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let restored = load(&path).await;
        assert_eq!(restored.assignments.get("late"), Some(&Team::Blue));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn flush_writes_immediately_and_disarms() {
        let path = temp_path();
        let (persister, game) = persister(&path);
        game.write().await.set_flag("red", "taken", "u1").unwrap();

        persister.schedule().await;
        persister.flush().await;

        assert!(!persister.is_armed().await);
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["flags"]["red"]["status"], "taken");
        assert!(raw.contains('\n'), "snapshot should be pretty-printed");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let path = std::env::temp_dir()
            .join(format!("missing_{}", Uuid::new_v4()))
            .join("state.json");
        let (persister, _game) = persister(&path);

        persister.schedule().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!persister.is_armed().await);
        assert!(tokio::fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn load_missing_or_malformed_file_starts_empty() {
        let missing = temp_path();
        assert_eq!(load(&missing).await, GameState::default());

        let malformed = temp_path();
        tokio::fs::write(&malformed, b"{ not json").await.unwrap();
        assert_eq!(load(&malformed).await, GameState::default());
        let _ = tokio::fs::remove_file(&malformed).await;
    }

    #[tokio::test]
    async fn load_applies_fields_present_in_file() {
        let path = temp_path();
        let doc = serde_json::json!({
            "assignments": { "u1": "blue", "u2": "green" },
            "scores": { "red": 2, "blue": 7 },
            "flagTransforms": { "blue": { "position": [1, 2, 3] } },
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let state = load(&path).await;
        assert_eq!(state.assignments.len(), 1);
        assert_eq!(state.scores, Scores { red: 2, blue: 7 });
        assert!(state.flag_transforms.contains_key("blue"));
        assert_eq!(state.flags, Default::default());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
