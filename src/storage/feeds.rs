use chrono::Utc;

use super::schema::Database;
use super::types::{AddFeedOutcome, DatabaseError, StoredFeed};
use crate::feed::{date, ChannelInfo, FeedRecord};

const FEED_COLUMNS: &str = "id, group_id, url, title, description, stamp";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Store a discovered feed.
    ///
    /// A URL that is already subscribed keeps its id and group; only the title,
    /// description and stamp are replaced.
    pub async fn add_feed(&self, feed: &FeedRecord) -> Result<AddFeedOutcome, DatabaseError> {
        let stamp = date::to_canonical(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM feed WHERE url = ?")
            .bind(&feed.url)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some((id,)) => {
                sqlx::query("UPDATE feed SET title = ?, description = ?, stamp = ? WHERE id = ?")
                    .bind(&feed.title)
                    .bind(&feed.description)
                    .bind(&stamp)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                AddFeedOutcome::Existing(id)
            }
            None => {
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO feed (group_id, url, title, description, stamp)
                    VALUES (?, ?, ?, ?, ?)
                    RETURNING id
                "#,
                )
                .bind(feed.group_id)
                .bind(&feed.url)
                .bind(&feed.title)
                .bind(&feed.description)
                .bind(&stamp)
                .fetch_one(&mut *tx)
                .await?;
                AddFeedOutcome::Added(id)
            }
        };

        tx.commit().await?;
        tracing::debug!(url = %feed.url, ?outcome, "Stored feed");
        Ok(outcome)
    }

    /// Apply channel metadata seen during a refresh.
    ///
    /// `None` fields keep the stored value. Returns false if the feed is gone.
    pub async fn update_feed(
        &self,
        feed_id: i64,
        channel: &ChannelInfo,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE feed
            SET title = COALESCE(?, title),
                description = COALESCE(?, description),
                stamp = ?
            WHERE id = ?
        "#,
        )
        .bind(channel.title.as_deref())
        .bind(channel.description.as_deref())
        .bind(date::to_canonical(&Utc::now()))
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<StoredFeed>, DatabaseError> {
        let feed = sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feed WHERE id = ?"))
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<StoredFeed>, DatabaseError> {
        let feed = sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feed WHERE url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Remove a feed and, through the foreign key, all of its items.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM feed WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Feed ids ordered by title.
    pub async fn list_feed_ids(&self) -> Result<Vec<i64>, DatabaseError> {
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM feed ORDER BY title COLLATE NOCASE, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
