//! Participant persistence.
//!
//! [`ParticipantStore`] is the only boundary the draw workflow writes through. The
//! bundled [`MemoryStore`] keeps the roster in memory and, when given a path,
//! mirrors every change to a JSON file that is reloaded on startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use draw_core::{Participant, ParticipantId, ParticipantPatch};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("participant {0} not found")]
    NotFound(ParticipantId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store data: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether repeating the same call could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::NotFound(_))
    }
}

/// Result of the conditional `is_picked` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Claimed,
    AlreadyPicked,
}

pub trait ParticipantStore: Send + Sync {
    /// Every participant, sorted by name.
    fn list(&self) -> BoxFuture<'_, Result<Vec<Participant>, StoreError>>;

    fn insert(&self, name: String) -> BoxFuture<'_, Result<Participant, StoreError>>;

    fn update_fields(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> BoxFuture<'_, Result<Participant, StoreError>>;

    /// Set `is_picked` only if it is currently false.
    fn mark_picked(&self, id: ParticipantId) -> BoxFuture<'_, Result<MarkOutcome, StoreError>>;

    fn reset_all(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    fn delete_all(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    next_id: ParticipantId,
    participants: Vec<Participant>,
}

impl Table {
    fn row_mut(&mut self, id: ParticipantId) -> Result<&mut Participant, StoreError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<RwLock<Table>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut table = Table::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Table>(&bytes) {
                Ok(saved) => {
                    tracing::info!(path = %path.display(), participants = saved.participants.len(), "loaded roster");
                    table = saved;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable roster file");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not read roster file");
            }
        }

        Self {
            table: Arc::new(RwLock::new(table)),
            persist_path: Some(path),
        }
    }

    /// Write a snapshot of `table` to the mirror file, if one is configured. The
    /// snapshot goes to a staging file that is renamed over the mirror, so a crash
    /// leaves either the old roster or the new one. A failed write is logged; the
    /// in-memory roster stays authoritative.
    async fn persist(&self, table: &Table) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let json = match serde_json::to_vec_pretty(table) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, "persist serialization failed");
                return;
            }
        };
        let staging = staging_path(path);
        if let Err(err) = tokio::fs::write(&staging, json).await {
            tracing::error!(path = %staging.display(), error = %err, "persist failed");
            return;
        }
        if let Err(err) = tokio::fs::rename(&staging, path).await {
            tracing::error!(path = %path.display(), error = %err, "persist rename failed");
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

impl ParticipantStore for MemoryStore {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Participant>, StoreError>> {
        Box::pin(async move {
            let mut participants = self.table.read().await.participants.clone();
            participants.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            Ok(participants)
        })
    }

    fn insert(&self, name: String) -> BoxFuture<'_, Result<Participant, StoreError>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            table.next_id += 1;
            let participant = Participant::new(table.next_id, name);
            table.participants.push(participant.clone());
            self.persist(&table).await;
            Ok(participant)
        })
    }

    fn update_fields(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> BoxFuture<'_, Result<Participant, StoreError>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            let row = table.row_mut(id)?;
            patch.apply(row);
            let updated = row.clone();
            self.persist(&table).await;
            Ok(updated)
        })
    }

    fn mark_picked(&self, id: ParticipantId) -> BoxFuture<'_, Result<MarkOutcome, StoreError>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            let row = table.row_mut(id)?;
            if row.is_picked {
                return Ok(MarkOutcome::AlreadyPicked);
            }
            row.is_picked = true;
            self.persist(&table).await;
            Ok(MarkOutcome::Claimed)
        })
    }

    fn reset_all(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            table.participants.iter_mut().for_each(Participant::reset);
            self.persist(&table).await;
            Ok(())
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut table = self.table.write().await;
            table.participants.clear();
            self.persist(&table).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn seeded(names: &[&str]) -> MemoryStore {
        let store = MemoryStore::default();
        for name in names {
            store.insert(name.to_string()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_list_sorts_by_name() {
        let store = seeded(&["Carol", "Alice", "Bob"]).await;
        let roster = store.list().await.unwrap();

        let names: Vec<_> = roster.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
        let ids: Vec<_> = roster.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(roster.iter().all(|p| !p.has_drawn && !p.is_picked && p.picked_who.is_none()));
    }

    #[tokio::test]
    async fn mark_picked_only_claims_once() {
        let store = seeded(&["Alice", "Bob"]).await;

        assert_eq!(store.mark_picked(2).await.unwrap(), MarkOutcome::Claimed);
        assert_eq!(store.mark_picked(2).await.unwrap(), MarkOutcome::AlreadyPicked);
        assert!(matches!(
            store.mark_picked(9).await,
            Err(StoreError::NotFound(9))
        ));
    }

    #[tokio::test]
    async fn update_fields_is_idempotent() {
        let store = seeded(&["Alice", "Bob"]).await;
        let once = store
            .update_fields(1, ParticipantPatch::drawn("Bob"))
            .await
            .unwrap();
        let twice = store
            .update_fields(1, ParticipantPatch::drawn("Bob"))
            .await
            .unwrap();

        assert_eq!(once, twice);
        assert!(twice.has_drawn);
        assert_eq!(twice.picked_who.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn reset_twice_matches_reset_once() {
        let store = seeded(&["Alice", "Bob"]).await;
        store.mark_picked(2).await.unwrap();
        store
            .update_fields(1, ParticipantPatch::drawn("Bob"))
            .await
            .unwrap();

        store.reset_all().await.unwrap();
        let once = store.list().await.unwrap();
        store.reset_all().await.unwrap();
        let twice = store.list().await.unwrap();

        assert_eq!(once, twice);
        assert!(twice
            .iter()
            .all(|p| !p.has_drawn && !p.is_picked && p.picked_who.is_none()));
    }

    #[tokio::test]
    async fn delete_all_empties_roster_but_keeps_ids_unique() {
        let store = seeded(&["Alice"]).await;
        store.delete_all().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        let again = store.insert("Alice".into()).await.unwrap();
        assert_eq!(again.id, 2);
    }

    #[tokio::test]
    async fn persistence_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!("gift_draw_{}.json", Uuid::new_v4()));
        let store = MemoryStore::with_persistence(path.clone()).await;
        store.insert("Alice".into()).await.unwrap();
        store.insert("Bob".into()).await.unwrap();
        store.mark_picked(2).await.unwrap();

        let reloaded = MemoryStore::with_persistence(path.clone()).await;
        let roster = reloaded.list().await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(roster[1].is_picked);
        assert_eq!(reloaded.insert("Carol".into()).await.unwrap().id, 3);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn persist_replaces_mirror_without_leaving_staging_file() {
        let path = std::env::temp_dir().join(format!("gift_draw_{}.json", Uuid::new_v4()));
        let staging = staging_path(&path);
        assert_eq!(staging, path.with_extension("json.tmp"));

        // a stale half-written staging file from an earlier crash is simply replaced
        tokio::fs::write(&staging, b"{\"next_id\": 4, \"partic").await.unwrap();

        let store = MemoryStore::with_persistence(path.clone()).await;
        store.insert("Alice".into()).await.unwrap();
        store.insert("Bob".into()).await.unwrap();
        store.reset_all().await.unwrap();

        assert!(!tokio::fs::try_exists(&staging).await.unwrap());
        let bytes = tokio::fs::read(&path).await.unwrap();
        let saved: Table = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(saved.next_id, 2);
        assert_eq!(saved.participants.len(), 2);

        let reloaded = MemoryStore::with_persistence(path.clone()).await;
        assert_eq!(reloaded.list().await.unwrap().len(), 2);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
