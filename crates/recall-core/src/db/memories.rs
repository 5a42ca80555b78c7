//! Memory database queries.
//!
//! Every query is scoped by `tenant_id` (and `user_id` where the caller
//! acts on behalf of a user). Ownership of a single record is checked by
//! the service layer after a lookup by id.

use recall_models::{
    new_id, now, MemoryFilter, MemoryRecord, MemorySource, MemoryUpdate, NewMemory,
    MEMORY_ID_PREFIX, USER_CONFIDENCE,
};

use super::DbPool;
use crate::{Error, Result};

/// Case folding for the `*_folded` columns and the patterns matched against
/// them. SQLite's `LOWER()` only folds ASCII, so both sides are folded here.
fn fold(text: &str) -> String {
    text.to_lowercase()
}

/// Escape `%`, `_` and `\` and wrap in wildcards for a case-insensitive
/// `LIKE ? ESCAPE '\'` substring match against a folded column.
fn contains_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in fold(needle).chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

pub async fn create_memory(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    input: NewMemory,
) -> Result<MemoryRecord> {
    let id = new_id(MEMORY_ID_PREFIX);
    let timestamp = now();
    let confidence = input.effective_confidence();

    sqlx::query_as::<_, MemoryRecord>(
        r#"
        INSERT INTO memories (
            id, tenant_id, user_id, type, source, content, subject, confidence,
            source_message_id, content_folded, subject_folded, is_deleted,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(tenant_id)
    .bind(user_id)
    .bind(input.memory_type.as_str())
    .bind(input.source.as_str())
    .bind(&input.content)
    .bind(&input.subject)
    .bind(confidence)
    .bind(&input.source_message_id)
    .bind(fold(&input.content))
    .bind(input.subject.as_deref().map(fold))
    .bind(timestamp)
    .bind(timestamp)
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// Look a memory up by id alone. Ownership is the caller's concern.
pub async fn get_memory(pool: &DbPool, id: &str) -> Result<MemoryRecord> {
    sqlx::query_as::<_, MemoryRecord>("SELECT * FROM memories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Memory not found: {}", id)))
}

/// Build the WHERE clause shared by `list_memories` and `count_memories`.
fn filter_clause(tenant_id: &str, user_id: &str, filter: &MemoryFilter) -> (String, Vec<String>) {
    let mut conditions: Vec<&str> = vec!["tenant_id = ?", "user_id = ?"];
    let mut bindings: Vec<String> = vec![tenant_id.to_string(), user_id.to_string()];

    if !filter.include_deleted {
        conditions.push("is_deleted = 0");
    }

    if let Some(memory_type) = &filter.memory_type {
        conditions.push("type = ?");
        bindings.push(memory_type.as_str().to_string());
    }

    if let Some(subject) = filter.subject.as_deref().filter(|s| !s.is_empty()) {
        conditions.push("COALESCE(subject_folded, '') LIKE ? ESCAPE '\\'");
        bindings.push(contains_pattern(subject));
    }

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        conditions.push("content_folded LIKE ? ESCAPE '\\'");
        bindings.push(contains_pattern(search));
    }

    (format!("WHERE {}", conditions.join(" AND ")), bindings)
}

/// One page of a user's memories, most recent first.
pub async fn list_memories(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    filter: &MemoryFilter,
) -> Result<Vec<MemoryRecord>> {
    let (where_clause, bindings) = filter_clause(tenant_id, user_id, filter);

    let query = format!(
        r#"
        SELECT * FROM memories
        {}
        ORDER BY created_at DESC, rowid DESC
        LIMIT ? OFFSET ?
        "#,
        where_clause
    );

    let mut q = sqlx::query_as::<_, MemoryRecord>(&query);
    for binding in &bindings {
        q = q.bind(binding);
    }
    q = q
        .bind(filter.effective_limit())
        .bind(filter.effective_offset());

    q.fetch_all(pool).await.map_err(Error::Database)
}

/// Total number of memories matching a filter, ignoring pagination.
pub async fn count_memories(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    filter: &MemoryFilter,
) -> Result<i64> {
    let (where_clause, bindings) = filter_clause(tenant_id, user_id, filter);
    let query = format!("SELECT COUNT(*) FROM memories {}", where_clause);

    let mut q = sqlx::query_as::<_, (i64,)>(&query);
    for binding in &bindings {
        q = q.bind(binding);
    }

    let (count,) = q.fetch_one(pool).await?;
    Ok(count)
}

/// Keyword lookup: active memories whose content or subject contains
/// `query` (case-insensitive), most recent first.
pub async fn find_relevant_memories(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<MemoryRecord>> {
    let pattern = contains_pattern(query);

    sqlx::query_as::<_, MemoryRecord>(
        r#"
        SELECT * FROM memories
        WHERE tenant_id = ? AND user_id = ? AND is_deleted = 0
        AND (
            content_folded LIKE ? ESCAPE '\'
            OR COALESCE(subject_folded, '') LIKE ? ESCAPE '\'
        )
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Active memories whose subject contains `phrase` (case-insensitive).
pub async fn find_memories_by_subject(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    phrase: &str,
    limit: i64,
) -> Result<Vec<MemoryRecord>> {
    sqlx::query_as::<_, MemoryRecord>(
        r#"
        SELECT * FROM memories
        WHERE tenant_id = ? AND user_id = ? AND is_deleted = 0
        AND subject_folded IS NOT NULL
        AND subject_folded LIKE ? ESCAPE '\'
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(contains_pattern(phrase))
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Most recent active memories of a user.
pub async fn list_recent_memories(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    limit: i64,
) -> Result<Vec<MemoryRecord>> {
    sqlx::query_as::<_, MemoryRecord>(
        r#"
        SELECT * FROM memories
        WHERE tenant_id = ? AND user_id = ? AND is_deleted = 0
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Active memories of a user among `ids`. Order is unspecified.
pub async fn get_active_memories_by_ids(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
    ids: &[String],
) -> Result<Vec<MemoryRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let query = format!(
        "SELECT * FROM memories WHERE tenant_id = ? AND user_id = ? AND is_deleted = 0 AND id IN ({})",
        placeholders.join(", ")
    );

    let mut q = sqlx::query_as::<_, MemoryRecord>(&query)
        .bind(tenant_id)
        .bind(user_id);
    for id in ids {
        q = q.bind(id);
    }

    q.fetch_all(pool).await.map_err(Error::Database)
}

/// Apply a user correction: new content (and optionally subject),
/// `USER_CORRECTED` with full confidence. The embedding handle is cleared
/// since it described the old content.
pub async fn update_memory_content(
    pool: &DbPool,
    id: &str,
    input: &MemoryUpdate,
) -> Result<MemoryRecord> {
    sqlx::query_as::<_, MemoryRecord>(
        r#"
        UPDATE memories SET
            content = ?,
            subject = COALESCE(?, subject),
            content_folded = ?,
            subject_folded = COALESCE(?, subject_folded),
            source = ?,
            confidence = ?,
            embedding_id = NULL,
            updated_at = ?
        WHERE id = ? AND is_deleted = 0
        RETURNING *
        "#,
    )
    .bind(&input.content)
    .bind(&input.subject)
    .bind(fold(&input.content))
    .bind(input.subject.as_deref().map(fold))
    .bind(MemorySource::UserCorrected.as_str())
    .bind(USER_CONFIDENCE)
    .bind(now())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Memory not found: {}", id)))
}

/// Mark a memory deleted. Deleting twice keeps the first `deleted_at`.
pub async fn soft_delete_memory(pool: &DbPool, id: &str) -> Result<MemoryRecord> {
    let timestamp = now();

    sqlx::query_as::<_, MemoryRecord>(
        r#"
        UPDATE memories SET
            is_deleted = 1,
            deleted_at = COALESCE(deleted_at, ?),
            updated_at = CASE WHEN is_deleted = 0 THEN ? ELSE updated_at END
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(timestamp)
    .bind(timestamp)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Memory not found: {}", id)))
}

/// Soft-delete every active memory of a user, returning the affected records.
pub async fn soft_delete_user_memories(
    pool: &DbPool,
    tenant_id: &str,
    user_id: &str,
) -> Result<Vec<MemoryRecord>> {
    let timestamp = now();

    sqlx::query_as::<_, MemoryRecord>(
        r#"
        UPDATE memories SET
            is_deleted = 1,
            deleted_at = ?,
            updated_at = ?
        WHERE tenant_id = ? AND user_id = ? AND is_deleted = 0
        RETURNING *
        "#,
    )
    .bind(timestamp)
    .bind(timestamp)
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Record the vector-index handle for a memory. Setting the same value
/// again is a no-op.
pub async fn set_embedding_id(
    pool: &DbPool,
    tenant_id: &str,
    id: &str,
    embedding_id: &str,
) -> Result<()> {
    let result = sqlx::query("UPDATE memories SET embedding_id = ? WHERE tenant_id = ? AND id = ?")
        .bind(embedding_id)
        .bind(tenant_id)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Memory not found: {}", id)));
    }

    Ok(())
}
