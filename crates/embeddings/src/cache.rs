//! Content-addressed embedding cache in SQLite.
//!
//! Rows are keyed by `(provider, model, provider_key, hash)`; identical text
//! embedded under the same provider configuration is computed once.

use std::{
    collections::{HashMap, HashSet},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::Result,
    sqlx::{QueryBuilder, Sqlite, SqlitePool},
    tracing::{debug, warn},
};

pub const EMBEDDING_CACHE_TABLE: &str = "embedding_cache";

/// Keys per `IN (...)` lookup, well under SQLite's bound-parameter limit.
const LOOKUP_CHUNK_SIZE: usize = 400;

const UPSERT_SQL: &str = r#"INSERT INTO embedding_cache
       (provider, model, provider_key, hash, embedding, dims, updated_at)
   VALUES (?, ?, ?, ?, ?, ?, ?)
   ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
     embedding = excluded.embedding,
     dims = excluded.dims,
     updated_at = excluded.updated_at"#;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The provider configuration half of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheScope {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: CacheScope,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub embedding: Vec<f32>,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    provider: String,
    model: String,
    provider_key: String,
    hash: String,
    embedding: String,
    dims: Option<i64>,
    updated_at: i64,
}

impl CacheRow {
    fn into_entry(self) -> Option<CacheEntry> {
        let embedding = parse_embedding(&self.hash, &self.embedding)?;
        Some(CacheEntry {
            key: CacheKey {
                scope: CacheScope {
                    provider: self.provider,
                    model: self.model,
                    provider_key: self.provider_key,
                },
                hash: self.hash,
            },
            embedding,
            updated_at: self.updated_at,
        })
    }
}

fn parse_embedding(hash: &str, raw: &str) -> Option<Vec<f32>> {
    match serde_json::from_str::<Vec<f32>>(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(hash, error = %e, "skipping unreadable cached embedding");
            None
        },
    }
}

/// SQLite-backed cache shared by every embedding service using the same pool.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheStore {
    pool: SqlitePool,
    enabled: bool,
}

impl EmbeddingCacheStore {
    pub fn new(pool: SqlitePool, enabled: bool) -> Self {
        Self { pool, enabled }
    }

    /// Create the table (if needed) and return a store on `pool`.
    pub async fn open(pool: SqlitePool, enabled: bool) -> Result<Self> {
        Self::init(&pool).await?;
        Ok(Self::new(pool, enabled))
    }

    /// Create the `embedding_cache` table if it doesn't exist.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS embedding_cache (
                provider     TEXT NOT NULL,
                model        TEXT NOT NULL,
                provider_key TEXT NOT NULL,
                hash         TEXT NOT NULL,
                embedding    TEXT NOT NULL,
                dims         INTEGER,
                updated_at   INTEGER NOT NULL,
                PRIMARY KEY (provider, model, provider_key, hash)
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch cached vectors for `hashes`. Misses are simply absent from the map.
    pub async fn lookup(
        &self,
        scope: &CacheScope,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        if !self.enabled || hashes.is_empty() {
            return Ok(found);
        }

        let mut seen = HashSet::new();
        let unique: Vec<&String> = hashes.iter().filter(|h| seen.insert(h.as_str())).collect();

        for batch in unique.chunks(LOOKUP_CHUNK_SIZE) {
            let mut qb: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("SELECT hash, embedding FROM embedding_cache WHERE provider = ");
            qb.push_bind(scope.provider.clone())
                .push(" AND model = ")
                .push_bind(scope.model.clone())
                .push(" AND provider_key = ")
                .push_bind(scope.provider_key.clone())
                .push(" AND hash IN (");
            let mut list = qb.separated(", ");
            for hash in batch {
                list.push_bind((*hash).clone());
            }
            list.push_unseparated(")");

            let rows: Vec<(String, String)> =
                qb.build_query_as().fetch_all(&self.pool).await?;
            for (hash, raw) in rows {
                if let Some(embedding) = parse_embedding(&hash, &raw) {
                    found.insert(hash, embedding);
                }
            }
        }

        debug!(
            provider = %scope.provider,
            requested = unique.len(),
            hits = found.len(),
            "embedding cache lookup"
        );
        Ok(found)
    }

    /// Insert or refresh vectors for `(hash, embedding)` pairs.
    pub async fn upsert(&self, scope: &CacheScope, entries: &[(&str, &[f32])]) -> Result<()> {
        self.upsert_at(scope, entries, now_ms()).await
    }

    pub(crate) async fn upsert_at(
        &self,
        scope: &CacheScope,
        entries: &[(&str, &[f32])],
        updated_at: i64,
    ) -> Result<()> {
        if !self.enabled || entries.is_empty() {
            return Ok(());
        }
        for (hash, embedding) in entries {
            sqlx::query(UPSERT_SQL)
                .bind(&scope.provider)
                .bind(&scope.model)
                .bind(&scope.provider_key)
                .bind(*hash)
                .bind(serde_json::to_string(embedding)?)
                .bind(embedding.len() as i64)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Evict the least recently written rows until at most `max_entries` remain.
    /// Returns the number of rows removed.
    pub async fn prune(&self, max_entries: Option<usize>) -> Result<u64> {
        let Some(max) = max_entries.filter(|m| *m > 0) else {
            return Ok(0);
        };
        if !self.enabled {
            return Ok(0);
        }
        let count = self.count().await?;
        if count <= max {
            return Ok(0);
        }
        let excess = (count - max) as i64;
        let removed = sqlx::query(
            r#"DELETE FROM embedding_cache WHERE rowid IN (
                 SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?
               )"#,
        )
        .bind(excess)
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(removed, max_entries = max, "pruned embedding cache");
        Ok(removed)
    }

    /// Copy every row of `source` into this store in one transaction.
    ///
    /// Either all rows land or none do; the error is returned after rollback.
    pub async fn seed(&self, source: &EmbeddingCacheStore) -> Result<u64> {
        if !self.enabled {
            return Ok(0);
        }
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT provider, model, provider_key, hash, embedding, dims, updated_at FROM embedding_cache",
        )
        .fetch_all(&source.pool)
        .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let res = sqlx::query(UPSERT_SQL)
                .bind(&row.provider)
                .bind(&row.model)
                .bind(&row.provider_key)
                .bind(&row.hash)
                .bind(&row.embedding)
                .bind(row.dims)
                .bind(row.updated_at)
                .execute(&mut *tx)
                .await;
            if let Err(e) = res {
                warn!(error = %e, "embedding cache seed failed, rolling back");
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "embedding cache seed rollback failed");
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;

        let copied = rows.len() as u64;
        debug!(copied, "seeded embedding cache");
        Ok(copied)
    }

    pub async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// All readable rows, oldest first.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT provider, model, provider_key, hash, embedding, dims, updated_at
             FROM embedding_cache ORDER BY updated_at ASC, hash ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(CacheRow::into_entry).collect())
    }
}
