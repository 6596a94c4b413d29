//! Label-partitioned SQLite document store.
//!
//! One table per record label, each row a JSON document. All writes during a
//! run go through the ingestion writer; the store itself only knows about
//! single inserts, batch inserts, bulk reads and truncate-by-source.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::records::{Label, Record, Source};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and migrate the store.
    ///
    /// A single connection is enough: the writer owns all mutation during a
    /// run and reads only happen before or after it.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Append one record to its label's table, returning the row id.
    pub async fn insert(&self, record: &Record) -> Result<i64> {
        let body = record.to_body()?;
        let sql = format!(r#"INSERT INTO "{}" (body) VALUES (?1)"#, record.label().as_str());
        let result = sqlx::query(&sql).bind(&body).execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Append a batch of records in one transaction, preserving order.
    pub async fn insert_batch(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let body = record.to_body()?;
            let sql = format!(r#"INSERT INTO "{}" (body) VALUES (?1)"#, record.label().as_str());
            sqlx::query(&sql).bind(&body).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// All records of one label, in insertion order.
    pub async fn all(&self, label: Label) -> Result<Vec<Record>> {
        let sql = format!(r#"SELECT body FROM "{}" ORDER BY id ASC"#, label.as_str());
        let bodies: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        bodies
            .iter()
            .map(|body| Record::from_body(label, body).map_err(Into::into))
            .collect()
    }

    /// Materialized filtered read over one label's table.
    pub async fn query<F>(&self, label: Label, predicate: F) -> Result<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        Ok(self
            .all(label)
            .await?
            .into_iter()
            .filter(|record| predicate(record))
            .collect())
    }

    pub async fn count(&self, label: Label) -> Result<u64> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, label.as_str());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Truncate exactly the tables belonging to one source, so a fresh run
    /// replaces rather than merges that source's data.
    pub async fn clear(&self, source: Source) -> Result<()> {
        for label in source.labels() {
            let sql = format!(r#"DELETE FROM "{}""#, label.as_str());
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        tracing::info!(source = %source, "cleared source tables");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{hash_user_id, Commit, Group, Story, User};

    async fn create_test_store() -> Store {
        Store::open("sqlite::memory:").await.unwrap()
    }

    fn commit(id: &str, author: &str, changed_loc: u64) -> Record {
        Record::Commit(Commit {
            id: id.to_string(),
            short_id: id.chars().take(4).collect(),
            timestamp: 1_687_000_000,
            changed_loc,
            project_id: 101,
            author_id: hash_user_id(author),
        })
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let store = create_test_store().await;

        store.insert(&commit("aaaa1111", "alice", 10)).await.unwrap();
        store.insert(&commit("bbbb2222", "bob", 5)).await.unwrap();

        let commits = store.all(Label::Commit).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0], commit("aaaa1111", "alice", 10));
        assert_eq!(commits[1], commit("bbbb2222", "bob", 5));
    }

    #[tokio::test]
    async fn test_batch_insert_preserves_order() {
        let store = create_test_store().await;
        let batch = vec![
            commit("aaaa1111", "alice", 10),
            commit("bbbb2222", "alice", 5),
            commit("cccc3333", "bob", 3),
        ];
        store.insert_batch(&batch).await.unwrap();

        let commits = store.all(Label::Commit).await.unwrap();
        assert_eq!(commits, batch);
    }

    #[tokio::test]
    async fn test_query_filters_records() {
        let store = create_test_store().await;
        store.insert(&commit("aaaa1111", "alice", 10)).await.unwrap();
        store.insert(&commit("bbbb2222", "bob", 5)).await.unwrap();

        let alice = hash_user_id("alice");
        let filtered = store
            .query(Label::Commit, |record| {
                matches!(record, Record::Commit(c) if c.author_id == alice)
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_truncates_only_one_source() {
        let store = create_test_store().await;
        store
            .insert(&Record::User(User { id: hash_user_id("alice") }))
            .await
            .unwrap();
        store
            .insert(&Record::Group(Group { id: 7, parent_id: None }))
            .await
            .unwrap();
        store
            .insert(&Record::Story(Story { id: 1, sprints: vec![3] }))
            .await
            .unwrap();

        store.clear(Source::GitLab).await.unwrap();

        assert_eq!(store.count(Label::User).await.unwrap(), 0);
        assert_eq!(store.count(Label::Group).await.unwrap(), 0);
        assert_eq!(store.count(Label::Story).await.unwrap(), 1);
    }
}
