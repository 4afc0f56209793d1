//! Search index adapter: denormalized documents keyed by entity id, for lookup
//! by non-key attributes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use relay_common::{AdapterKind, EntityId, PropagationError, PropagationTask, Revision};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::adapter::{AdapterAck, SecondaryAdapter};

const DEFAULT_SEARCH_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Documents and queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub handle: String,
    pub handle_lower: String,
    pub address: String,
    pub address_domain: Option<String>,
}

impl SearchDocument {
    /// Build the indexed form of a task. Fields longer than `max_field_bytes`
    /// cannot be indexed and fail permanently.
    pub fn from_task(
        task: &PropagationTask,
        max_field_bytes: usize,
    ) -> Result<Self, PropagationError> {
        for (field, value) in [("handle", &task.payload.handle), ("address", &task.payload.address)] {
            if value.len() > max_field_bytes {
                return Err(PropagationError::non_retryable(format!(
                    "{field} is {} bytes, index limit is {max_field_bytes}",
                    value.len()
                )));
            }
        }

        let address = task.payload.address.clone();
        let address_domain = address
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim().to_lowercase())
            .filter(|domain| !domain.is_empty());

        Ok(Self {
            entity_id: task.entity_id,
            revision: task.revision,
            handle: task.payload.handle.clone(),
            handle_lower: task.payload.handle.to_lowercase(),
            address,
            address_domain,
        })
    }
}

/// Lookup by handle text and/or address domain. Empty query matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub handle: Option<String>,
    pub domain: Option<String>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, 500)
    }
}

/// Document store behind the search adapter.
///
/// `upsert` must be conditional on revision: a document older than the stored
/// one returns `AdapterAck::Stale` and changes nothing.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, doc: &SearchDocument) -> Result<AdapterAck, PropagationError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, PropagationError>;
}

#[async_trait]
impl<I: SearchIndex + ?Sized> SearchIndex for Arc<I> {
    async fn upsert(&self, doc: &SearchDocument) -> Result<AdapterAck, PropagationError> {
        (**self).upsert(doc).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, PropagationError> {
        (**self).search(query).await
    }
}

// ---------------------------------------------------------------------------
// SearchAdapter
// ---------------------------------------------------------------------------

pub struct SearchAdapter<I> {
    index: I,
    max_field_bytes: usize,
}

impl<I: SearchIndex> SearchAdapter<I> {
    pub fn new(index: I, max_field_bytes: usize) -> Self {
        Self {
            index,
            max_field_bytes,
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }
}

#[async_trait]
impl<I: SearchIndex> SecondaryAdapter for SearchAdapter<I> {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Search
    }

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        let doc = SearchDocument::from_task(task, self.max_field_bytes)?;
        self.index.upsert(&doc).await
    }
}

// ---------------------------------------------------------------------------
// MemorySearchIndex
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySearchIndex {
    docs: RwLock<HashMap<EntityId, SearchDocument>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntityId) -> Option<SearchDocument> {
        self.docs.read().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> Result<AdapterAck, PropagationError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| PropagationError::non_retryable("search index state poisoned"))?;

        if docs
            .get(&doc.entity_id)
            .is_some_and(|current| current.revision > doc.revision)
        {
            return Ok(AdapterAck::Stale);
        }
        docs.insert(doc.entity_id, doc.clone());
        Ok(AdapterAck::Applied)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, PropagationError> {
        let docs = self
            .docs
            .read()
            .map_err(|_| PropagationError::non_retryable("search index state poisoned"))?;

        let needle = query.handle.as_deref().map(str::to_lowercase);
        let domain = query.domain.as_deref().map(str::to_lowercase);

        let mut hits: Vec<SearchDocument> = docs
            .values()
            .filter(|doc| {
                needle
                    .as_deref()
                    .map_or(true, |n| doc.handle_lower.contains(n))
            })
            .filter(|doc| {
                domain
                    .as_deref()
                    .map_or(true, |d| doc.address_domain.as_deref() == Some(d))
            })
            .cloned()
            .collect();

        hits.sort_by_key(|doc| doc.entity_id);
        hits.truncate(query.limit());
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// PgSearchIndex
// ---------------------------------------------------------------------------

/// `search_documents` table. The revision check lives in the upsert's
/// `WHERE`, so concurrent writers for one key cannot regress it.
#[derive(Clone)]
pub struct PgSearchIndex {
    pool: PgPool,
}

impl PgSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    entity_id: i64,
    revision: i64,
    handle: String,
    handle_lower: String,
    address: String,
    address_domain: Option<String>,
}

impl From<DocumentRow> for SearchDocument {
    fn from(row: DocumentRow) -> Self {
        SearchDocument {
            entity_id: row.entity_id,
            revision: row.revision,
            handle: row.handle,
            handle_lower: row.handle_lower,
            address: row.address,
            address_domain: row.address_domain,
        }
    }
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> Result<AdapterAck, PropagationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO search_documents (entity_id, revision, handle, handle_lower, address, address_domain)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_id)
            DO UPDATE SET revision = EXCLUDED.revision,
                          handle = EXCLUDED.handle,
                          handle_lower = EXCLUDED.handle_lower,
                          address = EXCLUDED.address,
                          address_domain = EXCLUDED.address_domain,
                          indexed_at = now()
            WHERE search_documents.revision <= EXCLUDED.revision
            "#,
        )
        .bind(doc.entity_id)
        .bind(doc.revision)
        .bind(&doc.handle)
        .bind(&doc.handle_lower)
        .bind(&doc.address)
        .bind(&doc.address_domain)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            Ok(AdapterAck::Stale)
        } else {
            Ok(AdapterAck::Applied)
        }
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, PropagationError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT entity_id, revision, handle, handle_lower, address, address_domain
            FROM search_documents
            WHERE ($1::text IS NULL OR strpos(handle_lower, lower($1)) > 0)
              AND ($2::text IS NULL OR address_domain = lower($2))
            ORDER BY entity_id ASC
            LIMIT $3
            "#,
        )
        .bind(query.handle.as_deref())
        .bind(query.domain.as_deref())
        .bind(query.limit() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }
}

/// Data and constraint errors will fail again on retry; anything else is
/// treated as a connectivity problem.
fn classify(err: sqlx::Error) -> PropagationError {
    if let sqlx::Error::Database(db) = &err {
        if db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23"))
        {
            return PropagationError::non_retryable(db.message().to_string());
        }
    }
    PropagationError::retryable(err.to_string())
}
