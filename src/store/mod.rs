/// Namespaced record store
///
/// Every entity table, single-valued lookup and two-part index lives in one
/// SQLite table keyed by `(namespace, key)`. Records are JSON documents; a
/// table may project one numeric field into `sort_value` for ranged queries,
/// and two-part indexes keep their halves in `part1`/`part2`.

use crate::{
    clock,
    error::{IdpError, IdpResult},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Upper bound on change subscribers per table
pub const MAX_SUBSCRIBERS: usize = 8;

/// Filter on the secondary sort field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBound {
    /// `sort_value <= v`
    AtMost(i64),
    /// `sort_value > v`
    After(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Secondary columns written alongside a record
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordMeta<'a> {
    pub part1: Option<&'a str>,
    pub part2: Option<&'a str>,
    pub sort_value: Option<i64>,
}

/// Raw access to the records table
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch a raw record value
    pub async fn get(&self, namespace: &str, key: &str) -> IdpResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM records WHERE namespace = ?1 AND key = ?2")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(IdpError::Database)?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(IdpError::Database)
    }

    /// Insert or replace a record
    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        meta: RecordMeta<'_>,
    ) -> IdpResult<()> {
        sqlx::query(
            "INSERT INTO records (namespace, key, part1, part2, sort_value, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(namespace, key) DO UPDATE SET
                part1 = excluded.part1,
                part2 = excluded.part2,
                sort_value = excluded.sort_value,
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(meta.part1)
        .bind(meta.part2)
        .bind(meta.sort_value)
        .bind(value)
        .bind(clock::now_ms())
        .execute(&self.pool)
        .await
        .map_err(IdpError::Database)?;

        Ok(())
    }

    /// Insert only if the key is free, returning whether this call claimed it
    pub async fn insert_new(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        meta: RecordMeta<'_>,
    ) -> IdpResult<bool> {
        let result = sqlx::query(
            "INSERT INTO records (namespace, key, part1, part2, sort_value, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(namespace, key) DO NOTHING",
        )
        .bind(namespace)
        .bind(key)
        .bind(meta.part1)
        .bind(meta.part2)
        .bind(meta.sort_value)
        .bind(value)
        .bind(clock::now_ms())
        .execute(&self.pool)
        .await
        .map_err(IdpError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a record, returning whether it existed
    pub async fn delete(&self, namespace: &str, key: &str) -> IdpResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE namespace = ?1 AND key = ?2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(IdpError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Records whose sort field satisfies `bound`, ordered by it
    pub async fn range(
        &self,
        namespace: &str,
        bound: SortBound,
        order: SortOrder,
        limit: Option<i64>,
    ) -> IdpResult<Vec<(String, String)>> {
        let (comparison, value) = match bound {
            SortBound::AtMost(v) => ("<=", v),
            SortBound::After(v) => (">", v),
        };
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            "SELECT key, value FROM records
             WHERE namespace = ?1 AND sort_value IS NOT NULL AND sort_value {} ?2
             ORDER BY sort_value {}, key ASC
             LIMIT ?3",
            comparison, direction
        );

        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(value)
            // SQLite treats a negative limit as unbounded
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await
            .map_err(IdpError::Database)?;

        rows.iter().map(key_value).collect()
    }

    /// Every record in a namespace
    pub async fn scan(&self, namespace: &str) -> IdpResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM records WHERE namespace = ?1 ORDER BY key")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(IdpError::Database)?;

        rows.iter().map(key_value).collect()
    }

    /// Two-part keys matching either half
    pub async fn find_parts(
        &self,
        namespace: &str,
        part1: Option<&str>,
        part2: Option<&str>,
    ) -> IdpResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT part1, part2 FROM records
             WHERE namespace = ?1
               AND part1 IS NOT NULL AND part2 IS NOT NULL
               AND (?2 IS NULL OR part1 = ?2)
               AND (?3 IS NULL OR part2 = ?3)
             ORDER BY part1, part2",
        )
        .bind(namespace)
        .bind(part1)
        .bind(part2)
        .fetch_all(&self.pool)
        .await
        .map_err(IdpError::Database)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("part1")?,
                    row.try_get::<String, _>("part2")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(IdpError::Database)
    }
}

fn key_value(row: &SqliteRow) -> IdpResult<(String, String)> {
    Ok((
        row.try_get::<String, _>("key").map_err(IdpError::Database)?,
        row.try_get::<String, _>("value").map_err(IdpError::Database)?,
    ))
}

/// A change observed on a table, carrying the affected record
pub enum Change<'a, T> {
    Upserted(&'a T),
    Deleted(&'a T),
}

impl<T> Clone for Change<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Change<'_, T> {}

/// Observer invoked after each successful write to a table
#[async_trait]
pub trait ChangeSubscriber<T>: Send + Sync {
    async fn on_change(&self, key: &str, change: Change<'_, T>) -> IdpResult<()>;
}

/// Typed view over one namespace
pub struct Table<T> {
    store: RecordStore,
    namespace: &'static str,
    sort_key: Option<fn(&T) -> i64>,
    subscribers: RwLock<Vec<Arc<dyn ChangeSubscriber<T>>>>,
    _marker: PhantomData<fn() -> T>,
}

/// Single-valued secondary lookup (`name -> id`)
pub type Lookup = Table<String>;

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: RecordStore, namespace: &'static str) -> Self {
        Self {
            store,
            namespace,
            sort_key: None,
            subscribers: RwLock::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// Project a numeric field into the sortable column
    pub fn sorted_by(mut self, sort_key: fn(&T) -> i64) -> Self {
        self.sort_key = Some(sort_key);
        self
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Register a change subscriber; only done while wiring the process
    pub fn subscribe(&self, subscriber: Arc<dyn ChangeSubscriber<T>>) -> IdpResult<()> {
        let mut subscribers = self
            .subscribers
            .write()
            .map_err(|_| IdpError::Internal("Subscriber list poisoned".to_string()))?;

        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(IdpError::Internal(format!(
                "Table {} already has {} subscribers",
                self.namespace, MAX_SUBSCRIBERS
            )));
        }

        subscribers.push(subscriber);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> IdpResult<Option<T>> {
        match self.store.get(self.namespace, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace, then notify subscribers
    pub async fn set(&self, key: &str, value: &T) -> IdpResult<()> {
        let raw = serde_json::to_string(value)?;
        let meta = RecordMeta {
            sort_value: self.sort_key.map(|f| f(value)),
            ..Default::default()
        };
        self.store.put(self.namespace, key, &raw, meta).await?;

        self.notify(key, Change::Upserted(value)).await;
        Ok(())
    }

    /// Claim a free key; existing records are left untouched
    pub async fn insert_new(&self, key: &str, value: &T) -> IdpResult<bool> {
        let raw = serde_json::to_string(value)?;
        let meta = RecordMeta {
            sort_value: self.sort_key.map(|f| f(value)),
            ..Default::default()
        };
        let inserted = self.store.insert_new(self.namespace, key, &raw, meta).await?;

        if inserted {
            self.notify(key, Change::Upserted(value)).await;
        }
        Ok(inserted)
    }

    /// Delete, notifying subscribers with the removed record
    pub async fn delete(&self, key: &str) -> IdpResult<bool> {
        if !self.has_subscribers() {
            return self.store.delete(self.namespace, key).await;
        }

        let previous = self.get(key).await?;
        let removed = self.store.delete(self.namespace, key).await?;

        if removed {
            if let Some(previous) = previous {
                self.notify(key, Change::Deleted(&previous)).await;
            }
        }

        Ok(removed)
    }

    /// Records ranged over the sort field
    pub async fn range(
        &self,
        bound: SortBound,
        order: SortOrder,
        limit: Option<i64>,
    ) -> IdpResult<Vec<T>> {
        let rows = self.store.range(self.namespace, bound, order, limit).await?;
        Ok(self.decode_rows(rows))
    }

    pub async fn all(&self) -> IdpResult<Vec<T>> {
        let rows = self.store.scan(self.namespace).await?;
        Ok(self.decode_rows(rows))
    }

    fn decode_rows(&self, rows: Vec<(String, String)>) -> Vec<T> {
        rows.into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(namespace = self.namespace, key = %key, "Skipping undecodable record: {}", e);
                    None
                }
            })
            .collect()
    }

    fn has_subscribers(&self) -> bool {
        self.subscribers
            .read()
            .map(|subscribers| !subscribers.is_empty())
            .unwrap_or(false)
    }

    async fn notify(&self, key: &str, change: Change<'_, T>) {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };

        for subscriber in subscribers {
            if let Err(e) = subscriber.on_change(key, change).await {
                tracing::warn!(namespace = self.namespace, key = %key, "Change subscriber failed: {}", e);
            }
        }
    }
}

/// Set of `(first, second)` pairs queryable by either half
#[derive(Clone)]
pub struct PairIndex {
    store: RecordStore,
    namespace: &'static str,
}

impl PairIndex {
    pub fn new(store: RecordStore, namespace: &'static str) -> Self {
        Self { store, namespace }
    }

    fn key(first: &str, second: &str) -> String {
        format!("{}\u{1f}{}", first, second)
    }

    pub async fn insert(&self, first: &str, second: &str) -> IdpResult<()> {
        let meta = RecordMeta {
            part1: Some(first),
            part2: Some(second),
            sort_value: None,
        };
        self.store
            .put(self.namespace, &Self::key(first, second), "true", meta)
            .await
    }

    pub async fn remove(&self, first: &str, second: &str) -> IdpResult<bool> {
        self.store
            .delete(self.namespace, &Self::key(first, second))
            .await
    }

    pub async fn contains(&self, first: &str, second: &str) -> IdpResult<bool> {
        Ok(self
            .store
            .get(self.namespace, &Self::key(first, second))
            .await?
            .is_some())
    }

    /// Every second half paired with `first`
    pub async fn seconds_for(&self, first: &str) -> IdpResult<Vec<String>> {
        let pairs = self.store.find_parts(self.namespace, Some(first), None).await?;
        Ok(pairs.into_iter().map(|(_, second)| second).collect())
    }

    /// Every first half paired with `second`
    pub async fn firsts_for(&self, second: &str) -> IdpResult<Vec<String>> {
        let pairs = self.store.find_parts(self.namespace, None, Some(second)).await?;
        Ok(pairs.into_iter().map(|(first, _)| first).collect())
    }
}
