use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

use super::schema::Database;
use super::types::{DatabaseError, StoredItem};
use crate::feed::{date, ItemRecord};

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Store one item, returning its row id.
    ///
    /// An item whose link is already stored for the same feed replaces that
    /// row's fields instead of creating a duplicate. Items without a link are
    /// always inserted.
    pub async fn add_item(&self, item: &ItemRecord) -> Result<i64, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let id = upsert_item(&mut tx, item, &date::to_canonical(&Utc::now())).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Store a batch in one transaction.
    pub async fn add_items(&self, items: &[ItemRecord]) -> Result<Vec<i64>, DatabaseError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let stamp = date::to_canonical(&Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(upsert_item(&mut tx, item, &stamp).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<StoredItem>, DatabaseError> {
        let item = sqlx::query_as(
            r#"
            SELECT id, feed_id, url, title, description, pubdate AS pub_date, stamp
            FROM item
            WHERE id = ?
        "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    /// Item ids of a feed, newest publish date first.
    pub async fn list_item_ids(&self, feed_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM item WHERE feed_id = ? ORDER BY pubdate DESC, id")
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Delete items of a feed that were last written before `older_than`.
    ///
    /// Items still present in the feed get a fresh stamp on every refresh, so
    /// only entries that dropped out of the feed age past the cutoff.
    pub async fn delete_old_items(
        &self,
        feed_id: i64,
        older_than: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM item WHERE feed_id = ? AND stamp < ?")
            .bind(feed_id)
            .bind(date::to_canonical(&older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_items(&self, feed_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM item WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn upsert_item(
    tx: &mut Transaction<'_, Sqlite>,
    item: &ItemRecord,
    stamp: &str,
) -> Result<i64, DatabaseError> {
    if !item.url.is_empty() {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM item WHERE feed_id = ? AND url = ? LIMIT 1")
                .bind(item.feed_id)
                .bind(&item.url)
                .fetch_optional(&mut **tx)
                .await?;

        if let Some((id,)) = existing {
            sqlx::query(
                "UPDATE item SET title = ?, description = ?, pubdate = ?, stamp = ? WHERE id = ?",
            )
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.pub_date)
            .bind(stamp)
            .bind(id)
            .execute(&mut **tx)
            .await?;
            return Ok(id);
        }
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO item (feed_id, url, title, description, pubdate, stamp)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
    "#,
    )
    .bind(item.feed_id)
    .bind(&item.url)
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.pub_date)
    .bind(stamp)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}
