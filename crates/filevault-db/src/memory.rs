//! In-memory implementation of the metadata store.
//!
//! Same observable contract as the Postgres repository, including storage-key
//! uniqueness and rollback-on-drop for transactions. Used by the test suites.

use crate::repository::{FileRepository, FileTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filevault_core::{AppError, File, FileStatus, NewFile};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    files: HashMap<Uuid, File>,
    /// Insertion order, used to break `created_at` ties when listing.
    order: Vec<Uuid>,
}

impl State {
    fn live(&self, id: Uuid) -> Option<&File> {
        self.files.get(&id).filter(|f| f.deleted_at.is_none())
    }

    fn live_mut(&mut self, id: Uuid) -> Result<&mut File, AppError> {
        self.files
            .get_mut(&id)
            .filter(|f| f.deleted_at.is_none())
            .ok_or_else(|| AppError::not_found_file(id))
    }

    fn key_taken(&self, storage_key: &str, except: Option<Uuid>) -> bool {
        self.files
            .values()
            .any(|f| f.storage_key == storage_key && Some(f.id) != except)
    }

    fn apply(&mut self, op: &StagedOp, now: DateTime<Utc>) -> Result<(), AppError> {
        let file = self.live_mut(op.id())?;
        match op {
            StagedOp::UpdateStatus(_, status) => file.status = *status,
            StagedOp::SoftDelete(_) => file.deleted_at = Some(now),
        }
        file.updated_at = now;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryFileRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fully formed record, timestamps included.
    pub async fn insert(&self, file: File) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if state.key_taken(&file.storage_key, Some(file.id)) {
            return Err(AppError::Conflict(format!(
                "Storage key {} already exists",
                file.storage_key
            )));
        }
        if !state.files.contains_key(&file.id) {
            state.order.push(file.id);
        }
        state.files.insert(file.id, file);
        Ok(())
    }

    /// Count of records, soft-deleted ones included.
    pub async fn raw_count(&self) -> usize {
        self.state.read().await.files.len()
    }
}

#[async_trait]
impl FileRepository for InMemoryFileRepository {
    async fn create(&self, new_file: NewFile) -> Result<File, AppError> {
        let mut state = self.state.write().await;
        if state.key_taken(&new_file.storage_key, None) {
            return Err(AppError::Conflict(format!(
                "Storage key {} already exists",
                new_file.storage_key
            )));
        }

        let file = new_file.into_file(Utc::now());
        state.order.push(file.id);
        state.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<File, AppError> {
        let state = self.state.read().await;
        state
            .live(id)
            .cloned()
            .ok_or_else(|| AppError::not_found_file(id))
    }

    async fn get_by_storage_key(&self, storage_key: &str) -> Result<Option<File>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .files
            .values()
            .find(|f| f.storage_key == storage_key && f.deleted_at.is_none())
            .cloned())
    }

    async fn update(&self, file: &File) -> Result<File, AppError> {
        let mut state = self.state.write().await;
        if state.key_taken(&file.storage_key, Some(file.id)) {
            return Err(AppError::Conflict(format!(
                "Storage key {} already exists",
                file.storage_key
            )));
        }

        let stored = state.live_mut(file.id)?;
        stored.name = file.name.clone();
        stored.size = file.size;
        stored.content_type = file.content_type.clone();
        stored.storage_key = file.storage_key.clone();
        stored.status = file.status;
        stored.hash = file.hash.clone();
        stored.upload_id = file.upload_id.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state.apply(&StagedOp::UpdateStatus(id, status), Utc::now())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state.apply(&StagedOp::SoftDelete(id), Utc::now())
    }

    async fn purge(&self, id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state.files.remove(&id);
        state.order.retain(|existing| *existing != id);
        Ok(())
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<File>, i64), AppError> {
        let state = self.state.read().await;
        let mut live: Vec<(usize, &File)> = state
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| state.live(*id).map(|f| (seq, f)))
            .collect();
        live.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });

        let total = live.len() as i64;
        let page = live
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(_, f)| f.clone())
            .collect();
        Ok((page, total))
    }

    async fn list_stale(
        &self,
        status: FileStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<File>, AppError> {
        let state = self.state.read().await;
        let mut stale: Vec<File> = state
            .files
            .values()
            .filter(|f| f.deleted_at.is_none() && f.status == status && f.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|f| f.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn begin(&self) -> Result<Box<dyn FileTransaction>, AppError> {
        Ok(Box::new(InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum StagedOp {
    UpdateStatus(Uuid, FileStatus),
    SoftDelete(Uuid),
}

impl StagedOp {
    fn id(&self) -> Uuid {
        match self {
            StagedOp::UpdateStatus(id, _) | StagedOp::SoftDelete(id) => *id,
        }
    }
}

/// Writes are staged and only applied on commit, so dropping the transaction
/// discards them.
pub struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    staged: Vec<StagedOp>,
}

impl InMemoryTransaction {
    /// Whether `id` is live as seen from inside this transaction.
    async fn visible(&self, id: Uuid) -> bool {
        let deleted_here = self
            .staged
            .iter()
            .any(|op| matches!(op, StagedOp::SoftDelete(staged) if *staged == id));
        !deleted_here && self.state.read().await.live(id).is_some()
    }
}

#[async_trait]
impl FileTransaction for InMemoryTransaction {
    async fn update_status(&mut self, id: Uuid, status: FileStatus) -> Result<(), AppError> {
        if !self.visible(id).await {
            return Err(AppError::not_found_file(id));
        }
        self.staged.push(StagedOp::UpdateStatus(id, status));
        Ok(())
    }

    async fn soft_delete(&mut self, id: Uuid) -> Result<(), AppError> {
        if !self.visible(id).await {
            return Err(AppError::not_found_file(id));
        }
        self.staged.push(StagedOp::SoftDelete(id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        // Validate everything first so a commit is all-or-nothing.
        let mut scratch: HashMap<Uuid, File> = HashMap::new();
        for op in &self.staged {
            let id = op.id();
            let current = match scratch.get(&id) {
                Some(file) => file.clone(),
                None => state
                    .live(id)
                    .cloned()
                    .ok_or_else(|| AppError::not_found_file(id))?,
            };
            if current.deleted_at.is_some() {
                return Err(AppError::not_found_file(id));
            }
            let mut next = current;
            match op {
                StagedOp::UpdateStatus(_, status) => next.status = *status,
                StagedOp::SoftDelete(_) => next.deleted_at = Some(now),
            }
            next.updated_at = now;
            scratch.insert(id, next);
        }

        state.files.extend(scratch);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}
