//! Persistence seam for newsletters, subscribers and click rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mbh_core::{
    ClickQuery, ClickRecord, HeadlineCount, NewClickRecord, Newsletter, Subscriber,
    SubscriberQuery, SubscriberStatus, SubscriberUpsert,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn list_newsletters(&self) -> Result<Vec<Newsletter>>;

    async fn newsletter(&self, list_id: &str) -> Result<Option<Newsletter>>;

    /// Returns `false` when the list id is already registered.
    async fn add_newsletter(&self, list_id: &str, name: &str) -> Result<bool>;

    /// Returns `false` when `list_id` is not a registered newsletter.
    async fn record_newsletter_sync(
        &self,
        list_id: &str,
        subscriber_count: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Hashes currently `subscribed` with `list_id` among their memberships.
    async fn subscriber_hashes_for_list(&self, list_id: &str) -> Result<Vec<String>>;

    /// Insert or revive rows; list membership is unioned, never replaced.
    async fn upsert_subscribers(&self, rows: &[SubscriberUpsert]) -> Result<u64>;

    /// Soft delete. Returns the number of rows whose status actually changed.
    async fn mark_deleted(&self, hashes: &[String]) -> Result<u64>;

    async fn count_subscribers(&self) -> Result<i64>;

    async fn subscribers(&self, query: &SubscriberQuery) -> Result<Vec<Subscriber>>;

    async fn subscriber(&self, subscriber_hash: &str) -> Result<Option<Subscriber>>;

    /// Distinct headlines already recorded for a subscriber, oldest first.
    async fn recorded_headlines(&self, subscriber_hash: &str) -> Result<Vec<String>>;

    async fn insert_click(&self, click: &NewClickRecord) -> Result<i64>;

    /// Overwrites `total_clicks`, creating the subscriber on first sighting.
    async fn set_total_clicks(&self, subscriber_hash: &str, list_id: &str, total: i64)
        -> Result<()>;

    async fn click_activity(&self, query: &ClickQuery) -> Result<Vec<ClickRecord>>;

    async fn most_popular_headline(&self, query: &ClickQuery) -> Result<Option<HeadlineCount>>;
}

#[derive(Clone)]
pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn newsletter_from_row(row: &PgRow) -> Result<Newsletter> {
    Ok(Newsletter {
        list_id: row.try_get("list_id")?,
        name: row.try_get("name")?,
        subscriber_count: row.try_get("subscriber_count")?,
        last_synced: row.try_get("last_synced")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber> {
    let status: String = row.try_get("status")?;
    Ok(Subscriber {
        subscriber_hash: row.try_get("subscriber_hash")?,
        status: status.parse::<SubscriberStatus>()?,
        list_ids: row.try_get("list_id")?,
        created_at: row.try_get("created_at")?,
        total_clicks: row.try_get("total_clicks")?,
    })
}

fn click_from_row(row: &PgRow) -> Result<ClickRecord> {
    Ok(ClickRecord {
        id: row.try_get("id")?,
        subscriber_hash: row.try_get("subscriber_hash")?,
        clicked_headline: row.try_get("clicked_headline")?,
        newsletter: row.try_get("newsletter")?,
        click_date: row.try_get("click_date")?,
    })
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn list_newsletters(&self) -> Result<Vec<Newsletter>> {
        let rows = sqlx::query(
            r#"
            SELECT list_id, name, subscriber_count, last_synced
              FROM newsletters
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("selecting newsletters")?;
        rows.iter().map(newsletter_from_row).collect()
    }

    async fn newsletter(&self, list_id: &str) -> Result<Option<Newsletter>> {
        let row = sqlx::query(
            r#"
            SELECT list_id, name, subscriber_count, last_synced
              FROM newsletters
             WHERE list_id = $1
            "#,
        )
        .bind(list_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("selecting newsletter {list_id}"))?;
        row.as_ref().map(newsletter_from_row).transpose()
    }

    async fn add_newsletter(&self, list_id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO newsletters (list_id, name, subscriber_count, last_synced)
            VALUES ($1, $2, 0, NULL)
            ON CONFLICT (list_id) DO NOTHING
            "#,
        )
        .bind(list_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting newsletter {list_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_newsletter_sync(
        &self,
        list_id: &str,
        subscriber_count: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE newsletters
               SET subscriber_count = $2,
                   last_synced = $3
             WHERE list_id = $1
            "#,
        )
        .bind(list_id)
        .bind(subscriber_count)
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating sync stats for {list_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscriber_hashes_for_list(&self, list_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT subscriber_hash
              FROM subscribers
             WHERE status = 'subscribed'
               AND $1 = ANY(list_id)
            "#,
        )
        .bind(list_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("selecting stored roster for {list_id}"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("subscriber_hash").map_err(anyhow::Error::from))
            .collect()
    }

    async fn upsert_subscribers(&self, rows: &[SubscriberUpsert]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let hashes = rows.iter().map(|r| r.subscriber_hash.clone()).collect::<Vec<_>>();
        let list_ids = rows.iter().map(|r| r.list_id.clone()).collect::<Vec<_>>();
        let created = rows.iter().map(|r| r.created_at).collect::<Vec<_>>();

        let result = sqlx::query(
            r#"
            INSERT INTO subscribers (subscriber_hash, status, list_id, created_at)
            SELECT t.subscriber_hash, 'subscribed', ARRAY[t.list_id], t.created_at
              FROM UNNEST($1::text[], $2::text[], $3::timestamptz[])
                   AS t(subscriber_hash, list_id, created_at)
            ON CONFLICT (subscriber_hash) DO UPDATE
               SET status = 'subscribed',
                   list_id = CASE
                       WHEN EXCLUDED.list_id[1] = ANY(subscribers.list_id) THEN subscribers.list_id
                       ELSE array_append(subscribers.list_id, EXCLUDED.list_id[1])
                   END,
                   created_at = COALESCE(EXCLUDED.created_at, subscribers.created_at)
            "#,
        )
        .bind(hashes)
        .bind(list_ids)
        .bind(created)
        .execute(&self.pool)
        .await
        .context("upserting subscribers")?;
        Ok(result.rows_affected())
    }

    async fn mark_deleted(&self, hashes: &[String]) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE subscribers
               SET status = 'deleted'
             WHERE subscriber_hash = ANY($1)
               AND status <> 'deleted'
            "#,
        )
        .bind(hashes)
        .execute(&self.pool)
        .await
        .context("marking subscribers deleted")?;
        Ok(result.rows_affected())
    }

    async fn count_subscribers(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscribers")
            .fetch_one(&self.pool)
            .await
            .context("counting subscribers")?;
        Ok(count)
    }

    async fn subscribers(&self, query: &SubscriberQuery) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT subscriber_hash, status, list_id, created_at, total_clicks
              FROM subscribers
             WHERE ($1::text IS NULL OR $1 = ANY(list_id))
               AND ($2::timestamptz IS NULL OR created_at >= $2)
             ORDER BY total_clicks DESC, subscriber_hash
             LIMIT $3
            "#,
        )
        .bind(query.list_id.as_deref())
        .bind(query.created_after)
        .bind(query.limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("selecting subscribers")?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn subscriber(&self, subscriber_hash: &str) -> Result<Option<Subscriber>> {
        let row = sqlx::query(
            r#"
            SELECT subscriber_hash, status, list_id, created_at, total_clicks
              FROM subscribers
             WHERE subscriber_hash = $1
            "#,
        )
        .bind(subscriber_hash)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("selecting subscriber {subscriber_hash}"))?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn recorded_headlines(&self, subscriber_hash: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT clicked_headline
              FROM click_activity
             WHERE subscriber_hash = $1
             GROUP BY clicked_headline
             ORDER BY MIN(id)
            "#,
        )
        .bind(subscriber_hash)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("selecting recorded clicks for {subscriber_hash}"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("clicked_headline").map_err(anyhow::Error::from))
            .collect()
    }

    async fn insert_click(&self, click: &NewClickRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO click_activity (subscriber_hash, clicked_headline, newsletter, click_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&click.subscriber_hash)
        .bind(&click.clicked_headline)
        .bind(&click.newsletter)
        .bind(click.click_date)
        .fetch_one(&self.pool)
        .await
        .context("inserting click activity")?;
        Ok(id)
    }

    async fn set_total_clicks(
        &self,
        subscriber_hash: &str,
        list_id: &str,
        total: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (subscriber_hash, status, list_id, total_clicks)
            VALUES ($1, 'subscribed', ARRAY[$2::text], $3)
            ON CONFLICT (subscriber_hash) DO UPDATE
               SET total_clicks = EXCLUDED.total_clicks
            "#,
        )
        .bind(subscriber_hash)
        .bind(list_id)
        .bind(total)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating total clicks for {subscriber_hash}"))?;
        Ok(())
    }

    async fn click_activity(&self, query: &ClickQuery) -> Result<Vec<ClickRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscriber_hash, clicked_headline, newsletter, click_date
              FROM click_activity
             WHERE ($1::timestamptz IS NULL OR click_date >= $1)
               AND ($2::timestamptz IS NULL OR click_date <= $2)
               AND ($3::text IS NULL OR newsletter = $3)
             ORDER BY click_date DESC NULLS LAST, id DESC
             LIMIT $4
            "#,
        )
        .bind(query.start)
        .bind(query.end)
        .bind(query.newsletter.as_deref())
        .bind(query.limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("selecting click activity")?;
        rows.iter().map(click_from_row).collect()
    }

    async fn most_popular_headline(&self, query: &ClickQuery) -> Result<Option<HeadlineCount>> {
        let row = sqlx::query(
            r#"
            SELECT clicked_headline, COUNT(*) AS click_count
              FROM click_activity
             WHERE ($1::timestamptz IS NULL OR click_date >= $1)
               AND ($2::timestamptz IS NULL OR click_date <= $2)
               AND ($3::text IS NULL OR newsletter = $3)
             GROUP BY clicked_headline
             ORDER BY click_count DESC, clicked_headline
             LIMIT 1
            "#,
        )
        .bind(query.start)
        .bind(query.end)
        .bind(query.newsletter.as_deref())
        .fetch_optional(&self.pool)
        .await
        .context("selecting most popular headline")?;

        row.map(|row| -> Result<HeadlineCount> {
            Ok(HeadlineCount {
                clicked_headline: row.try_get("clicked_headline")?,
                click_count: row.try_get("click_count")?,
            })
        })
        .transpose()
    }
}
