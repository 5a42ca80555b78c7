//! Per-tenant vector storage on Qdrant.
//!
//! Every tenant gets its own collection, named deterministically from the
//! tenant id. Points carry the memory they index in their payload (see the
//! `KEY_*` constants) and searches are always scoped to one user.

use std::collections::HashMap;
use std::sync::Arc;

use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors_config::Config as VectorsConfig, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId, PointStruct,
    ScoredPoint, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Qdrant client error: {0}")]
    Client(String),

    #[error("Collection {collection}: {message}")]
    Collection { collection: String, message: String },

    #[error("Point operation on {collection} failed: {message}")]
    Points { collection: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    /// Prepended to the sanitized tenant id
    pub collection_prefix: String,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>, collection_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection_prefix: collection_prefix.into(),
        }
    }
}

// Payload keys
pub const KEY_MEMORY_ID: &str = "memory_id";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_TYPE: &str = "type";
pub const KEY_SUBJECT: &str = "subject";
pub const KEY_CONTENT: &str = "content";
pub const KEY_CREATED_AT: &str = "created_at";

/// What `ensure_collection` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Existing,
    Created,
    /// Dropped and recreated because the vector size changed
    Recreated { previous_dimension: usize },
}

/// A user-scoped similarity query.
#[derive(Debug, Clone)]
pub struct UserSearch<'a> {
    pub user_id: &'a str,
    pub vector: Vec<f32>,
    pub limit: usize,
    pub score_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

#[derive(Clone)]
pub struct QdrantService {
    inner: Arc<Inner>,
}

struct Inner {
    client: Qdrant,
    prefix: String,
}

impl QdrantService {
    /// Build the client and probe the server.
    ///
    /// An unreachable server is only logged; operations fail until it is up.
    pub async fn new(config: &QdrantConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;

        let service = Self {
            inner: Arc::new(Inner {
                client,
                prefix: config.collection_prefix.clone(),
            }),
        };

        match service.inner.client.health_check().await {
            Ok(reply) => info!(
                url = %config.url,
                prefix = %config.collection_prefix,
                version = %reply.version,
                "Connected to Qdrant"
            ),
            Err(e) => warn!(url = %config.url, error = %e, "Qdrant not reachable yet"),
        }

        Ok(service)
    }

    pub fn collection_name(&self, tenant_id: &str) -> String {
        collection_name_for(&self.inner.prefix, tenant_id)
    }

    pub async fn collection_exists(&self, tenant_id: &str) -> Result<bool> {
        let collection = self.collection_name(tenant_id);
        self.inner
            .client
            .collection_exists(&collection)
            .await
            .map_err(|e| collection_error(&collection, e))
    }

    /// Vector size of an existing collection, `None` when it is not a
    /// single unnamed vector.
    async fn dimension_of(&self, collection: &str) -> Result<Option<usize>> {
        let info = self
            .inner
            .client
            .collection_info(collection)
            .await
            .map_err(|e| collection_error(collection, e))?;

        Ok(info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|vc| match vc.config {
                Some(VectorsConfig::Params(params)) => Some(params.size as usize),
                _ => None,
            }))
    }

    /// Make sure the tenant's collection exists with vectors of `dimension`.
    ///
    /// A collection of another size is dropped and recreated, losing its
    /// points; they come back as memories are re-embedded.
    pub async fn ensure_collection(
        &self,
        tenant_id: &str,
        dimension: usize,
    ) -> Result<CollectionState> {
        let collection = self.collection_name(tenant_id);
        let mut state = CollectionState::Created;

        if self.collection_exists(tenant_id).await? {
            let existing = self.dimension_of(&collection).await?.unwrap_or(0);
            if existing == dimension {
                return Ok(CollectionState::Existing);
            }

            warn!(
                collection = %collection,
                existing,
                dimension,
                "Vector size changed, recreating collection"
            );
            self.inner
                .client
                .delete_collection(&collection)
                .await
                .map_err(|e| collection_error(&collection, e))?;
            state = CollectionState::Recreated {
                previous_dimension: existing,
            };
        }

        self.inner
            .client
            .create_collection(
                CreateCollectionBuilder::new(&collection)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| collection_error(&collection, e))?;

        info!(collection = %collection, dimension, "Created tenant collection");
        Ok(state)
    }

    pub async fn upsert(
        &self,
        tenant_id: &str,
        id: &str,
        vector: Vec<f32>,
        payload: HashMap<String, Value>,
    ) -> Result<()> {
        let collection = self.collection_name(tenant_id);
        let payload: HashMap<String, QdrantValue> = payload
            .into_iter()
            .filter_map(|(key, value)| to_qdrant(value).map(|v| (key, v)))
            .collect();

        self.inner
            .client
            .upsert_points(UpsertPointsBuilder::new(
                &collection,
                vec![PointStruct::new(id.to_string(), vector, payload)],
            ))
            .await
            .map_err(|e| points_error(&collection, e))?;

        debug!(collection = %collection, point_id = %id, "Upserted point");
        Ok(())
    }

    /// Nearest points owned by `query.user_id`, at or above the threshold.
    pub async fn search_user(
        &self,
        tenant_id: &str,
        query: UserSearch<'_>,
    ) -> Result<Vec<VectorSearchResult>> {
        let collection = self.collection_name(tenant_id);
        let request = SearchPointsBuilder::new(&collection, query.vector, query.limit as u64)
            .filter(user_filter(query.user_id))
            .score_threshold(query.score_threshold)
            .with_payload(true);

        let response = self
            .inner
            .client
            .search_points(request)
            .await
            .map_err(|e| points_error(&collection, e))?;

        Ok(response.result.into_iter().map(into_result).collect())
    }

    pub async fn delete_points(&self, tenant_id: &str, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let collection = self.collection_name(tenant_id);
        let count = ids.len();
        let ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();

        self.inner
            .client
            .delete_points(DeletePointsBuilder::new(&collection).points(ids))
            .await
            .map_err(|e| points_error(&collection, e))?;

        debug!(collection = %collection, count, "Deleted points");
        Ok(())
    }
}

fn collection_error(collection: &str, err: impl std::fmt::Display) -> Error {
    Error::Collection {
        collection: collection.to_string(),
        message: err.to_string(),
    }
}

fn points_error(collection: &str, err: impl std::fmt::Display) -> Error {
    Error::Points {
        collection: collection.to_string(),
        message: err.to_string(),
    }
}

/// Longest sanitized tenant part kept in a collection name.
const MAX_TENANT_PART: usize = 48;

/// Collection name for a tenant: a readable part (ASCII alphanumerics, `-`
/// and `_`, lowercased, everything else `_`) followed by the first 16 hex
/// digits of the SHA-256 of the raw tenant id, so tenants that sanitize to
/// the same text still get their own collection.
pub fn collection_name_for(prefix: &str, tenant_id: &str) -> String {
    let readable: String = tenant_id
        .chars()
        .take(MAX_TENANT_PART)
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    let digest = hex::encode(Sha256::digest(tenant_id.as_bytes()));
    format!("{prefix}{readable}_{}", &digest[..16])
}

fn user_filter(user_id: &str) -> Filter {
    Filter::must([Condition::matches(KEY_USER_ID, user_id.to_string())])
}

fn to_qdrant(value: Value) -> Option<QdrantValue> {
    let value = match value {
        Value::Null => return None,
        Value::Bool(b) => QdrantValue::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => QdrantValue::from(i),
            None => QdrantValue::from(n.as_f64()?),
        },
        Value::String(s) => QdrantValue::from(s),
        Value::Array(items) => {
            QdrantValue::from(items.into_iter().filter_map(to_qdrant).collect::<Vec<_>>())
        }
        // Payloads are flat; nested objects are kept as JSON text
        object @ Value::Object(_) => QdrantValue::from(object.to_string()),
    };
    Some(value)
}

fn to_json(value: QdrantValue) -> Option<Value> {
    Some(match value.kind? {
        Kind::NullValue(_) => Value::Null,
        Kind::BoolValue(b) => Value::Bool(b),
        Kind::IntegerValue(i) => Value::from(i),
        Kind::DoubleValue(d) => Value::from(serde_json::Number::from_f64(d)?),
        Kind::StringValue(s) => Value::String(s),
        Kind::ListValue(list) => Value::Array(list.values.into_iter().filter_map(to_json).collect()),
        Kind::StructValue(fields) => Value::Object(
            fields
                .fields
                .into_iter()
                .filter_map(|(k, v)| to_json(v).map(|v| (k, v)))
                .collect(),
        ),
    })
}

fn into_result(point: ScoredPoint) -> VectorSearchResult {
    let id = match point.id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    };

    VectorSearchResult {
        id,
        score: point.score,
        payload: point
            .payload
            .into_iter()
            .filter_map(|(k, v)| to_json(v).map(|v| (k, v)))
            .collect(),
    }
}
