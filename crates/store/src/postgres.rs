//! PostgreSQL sink over the star-schema catalog.
//!
//! Work items come from `dim_song` (title) joined with `dim_artist` through
//! `dim_song_artist` (performer names). Results are written as rows of
//! `dim_song_genre` pointing at `dim_genre`. Concurrent writers from any process
//! are serialized per item with a transaction-scoped advisory lock, and the link
//! table carries a unique index so duplicate rows are impossible.

use crate::{RangeProgress, Sink, StoreError, UpsertOutcome, WorkItem};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(StoreError::backend)?;
        let sink = Self { pool };
        sink.ensure_constraints().await?;
        tracing::info!(max_connections, "connected postgres sink");
        Ok(sink)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unique indexes backing the `ON CONFLICT` clauses below.
    pub async fn ensure_constraints(&self) -> Result<(), StoreError> {
        for ddl in [
            "CREATE UNIQUE INDEX IF NOT EXISTS dim_genre_name_uq ON dim_genre (genre_name)",
            "CREATE UNIQUE INDEX IF NOT EXISTS dim_song_genre_uq ON dim_song_genre (song_id, genre_id)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn work_items(&self, range: RangeInclusive<i64>) -> Result<Vec<WorkItem>, StoreError> {
        let rows: Vec<(i64, String, Option<String>)> = sqlx::query_as(
            "SELECT ds.song_id::bigint, ds.song_title, string_agg(da.artist_name, ', ') \
             FROM dim_song ds \
             LEFT JOIN dim_song_artist dsa ON ds.song_id = dsa.song_id \
             LEFT JOIN dim_artist da ON dsa.artist_id = da.artist_id \
             WHERE ds.song_id BETWEEN $1 AND $2 \
             GROUP BY ds.song_id, ds.song_title \
             ORDER BY ds.song_id",
        )
        .bind(*range.start())
        .bind(*range.end())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows
            .into_iter()
            .map(|(id, primary_text, related_text)| WorkItem {
                id,
                primary_text,
                related_text,
            })
            .collect())
    }

    async fn classified_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT song_id::bigint FROM dim_song_genre WHERE song_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().collect())
    }

    async fn has_result(&self, id: i64) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM dim_song_genre WHERE song_id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::backend)
    }

    async fn upsert_tags(
        &self,
        id: i64,
        tags: &BTreeSet<String>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM dim_song_genre WHERE song_id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        if exists {
            tx.rollback().await.map_err(StoreError::backend)?;
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        for tag in tags {
            let genre_id: i64 = sqlx::query_scalar(
                "INSERT INTO dim_genre (genre_name) VALUES ($1) \
                 ON CONFLICT (genre_name) DO UPDATE SET genre_name = EXCLUDED.genre_name \
                 RETURNING genre_id::bigint",
            )
            .bind(tag)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

            sqlx::query(
                "INSERT INTO dim_song_genre (song_id, genre_id) VALUES ($1, $2) \
                 ON CONFLICT (song_id, genre_id) DO NOTHING",
            )
            .bind(id)
            .bind(genre_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(UpsertOutcome::Inserted(tags.len()))
    }

    async fn tags_for(&self, id: i64) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT dg.genre_name FROM dim_song_genre dsg \
             JOIN dim_genre dg ON dsg.genre_id = dg.genre_id \
             WHERE dsg.song_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().collect())
    }

    async fn progress(&self, range: RangeInclusive<i64>) -> Result<RangeProgress, StoreError> {
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            return Err(StoreError::InvalidRange { start, end });
        }
        let (total, classified): (i64, i64) = sqlx::query_as(
            "SELECT \
               (SELECT COUNT(*) FROM dim_song WHERE song_id BETWEEN $1 AND $2), \
               (SELECT COUNT(DISTINCT song_id) FROM dim_song_genre WHERE song_id BETWEEN $1 AND $2)",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(RangeProgress {
            total: total.max(0) as u64,
            classified: classified.max(0) as u64,
        })
    }
}
