//! Tenant-scoped memory store.
//!
//! Wraps the query functions in `db::memories` with input validation and
//! ownership checks. Records are looked up by id alone and ownership is
//! verified afterwards, so a record of another tenant or user surfaces as
//! `Forbidden` rather than `NotFound`.

use recall_models::{MemoryFilter, MemoryPage, MemoryRecord, MemoryUpdate, NewMemory};
use tracing::{debug, info, warn};

use crate::db::{self, DbPool};
use crate::{Error, Result};

/// Phrase a caller must send to wipe every memory of a user.
pub const FORGET_CONFIRMATION: &str = "FORGET";

/// Outcome of [`MemoryStore::forget_all`].
#[derive(Debug, Clone, Default)]
pub struct Forgotten {
    pub count: u64,
    /// Vector-index handles of the deleted records, for cleanup
    pub embedding_ids: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryStore {
    db: DbPool,
}

impl MemoryStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        user_id: &str,
        input: NewMemory,
    ) -> Result<MemoryRecord> {
        if input.content.trim().is_empty() {
            return Err(Error::Validation("Memory content cannot be empty".into()));
        }

        let record = db::create_memory(&self.db, tenant_id, user_id, input).await?;

        debug!(
            tenant_id = %tenant_id,
            memory_id = %record.id,
            memory_type = %record.memory_type,
            source = %record.source,
            "Memory created"
        );

        Ok(record)
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        user_id: &str,
        filter: &MemoryFilter,
    ) -> Result<MemoryPage> {
        let records = db::list_memories(&self.db, tenant_id, user_id, filter).await?;
        let total = db::count_memories(&self.db, tenant_id, user_id, filter).await?;
        Ok(MemoryPage { records, total })
    }

    /// Keyword lookup over content and subject, most recent first.
    pub async fn find_relevant(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        db::find_relevant_memories(&self.db, tenant_id, user_id, query, limit as i64).await
    }

    pub async fn get(&self, tenant_id: &str, memory_id: &str, user_id: &str) -> Result<MemoryRecord> {
        let record = db::get_memory(&self.db, memory_id).await?;
        check_owner(&record, tenant_id, user_id)?;
        Ok(record)
    }

    /// Apply a user correction. The record becomes `USER_CORRECTED` with
    /// full confidence.
    pub async fn update(
        &self,
        tenant_id: &str,
        memory_id: &str,
        user_id: &str,
        input: &MemoryUpdate,
    ) -> Result<MemoryRecord> {
        if input.content.trim().is_empty() {
            return Err(Error::Validation("Memory content cannot be empty".into()));
        }

        let existing = db::get_memory(&self.db, memory_id).await?;
        check_owner(&existing, tenant_id, user_id)?;

        let record = db::update_memory_content(&self.db, memory_id, input).await?;

        info!(tenant_id = %tenant_id, memory_id = %memory_id, "Memory corrected by user");

        Ok(record)
    }

    /// Soft-delete a record. Deleting an already deleted record succeeds
    /// and keeps the original `deleted_at`.
    pub async fn soft_delete(
        &self,
        tenant_id: &str,
        memory_id: &str,
        user_id: &str,
    ) -> Result<MemoryRecord> {
        let existing = db::get_memory(&self.db, memory_id).await?;
        check_owner(&existing, tenant_id, user_id)?;

        let record = db::soft_delete_memory(&self.db, memory_id).await?;

        info!(tenant_id = %tenant_id, memory_id = %memory_id, "Memory deleted");

        Ok(record)
    }

    /// Soft-delete every active memory of a user. Nothing is touched unless
    /// `confirmation` is exactly [`FORGET_CONFIRMATION`].
    pub async fn forget_all(
        &self,
        tenant_id: &str,
        user_id: &str,
        confirmation: &str,
    ) -> Result<Forgotten> {
        if confirmation != FORGET_CONFIRMATION {
            warn!(tenant_id = %tenant_id, user_id = %user_id, "Forget-all rejected: bad confirmation");
            return Err(Error::Forbidden(format!(
                "Confirmation phrase must be exactly \"{}\"",
                FORGET_CONFIRMATION
            )));
        }

        let records = db::soft_delete_user_memories(&self.db, tenant_id, user_id).await?;

        info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            count = records.len(),
            "Forgot all memories of user"
        );

        Ok(Forgotten {
            count: records.len() as u64,
            embedding_ids: records.into_iter().filter_map(|r| r.embedding_id).collect(),
        })
    }

    /// Record the vector-index handle of a memory. No ownership check.
    pub async fn attach_embedding_id(
        &self,
        tenant_id: &str,
        memory_id: &str,
        embedding_id: &str,
    ) -> Result<()> {
        db::set_embedding_id(&self.db, tenant_id, memory_id, embedding_id).await
    }
}

fn check_owner(record: &MemoryRecord, tenant_id: &str, user_id: &str) -> Result<()> {
    if record.tenant_id != tenant_id || record.user_id != user_id {
        return Err(Error::Forbidden(format!(
            "Memory {} does not belong to the caller",
            record.id
        )));
    }
    Ok(())
}
