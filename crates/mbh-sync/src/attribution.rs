//! Click Attributor: turns one subscriber's raw activity into deduplicated click rows.

use std::collections::HashSet;

use anyhow::{Context, Result};
use mbh_adapters::{extract_slug, ActivitySource, HeadlineResolver};
use mbh_core::{ActivityEvent, NewClickRecord, SubscriberQuery};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::MembershipStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Fetched,
    FetchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributionSummary {
    pub subscriber_hash: String,
    pub clicks_seen: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub activity: ActivityStatus,
    pub total_clicks_updated: bool,
}

impl AttributionSummary {
    fn new(subscriber_hash: &str) -> Self {
        Self {
            subscriber_hash: subscriber_hash.to_string(),
            clicks_seen: 0,
            processed: 0,
            skipped: 0,
            errors: 0,
            activity: ActivityStatus::Fetched,
            total_clicks_updated: false,
        }
    }
}

/// Counters across a batch of subscribers, as shown to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributionRunSummary {
    pub list_id: String,
    pub subscribers: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub fetch_failures: usize,
}

impl AttributionRunSummary {
    fn absorb(&mut self, one: &AttributionSummary) {
        self.subscribers += 1;
        self.processed += one.processed;
        self.skipped += one.skipped;
        self.errors += one.errors;
        if one.activity == ActivityStatus::FetchFailed {
            self.fetch_failures += 1;
        }
    }
}

pub struct ClickAttributor<'a> {
    activity: &'a dyn ActivitySource,
    headlines: &'a dyn HeadlineResolver,
    store: &'a dyn MembershipStore,
}

impl<'a> ClickAttributor<'a> {
    pub fn new(
        activity: &'a dyn ActivitySource,
        headlines: &'a dyn HeadlineResolver,
        store: &'a dyn MembershipStore,
    ) -> Self {
        Self {
            activity,
            headlines,
            store,
        }
    }

    /// Load the subscriber's recorded headlines, then attribute.
    pub async fn attribute_subscriber(
        &self,
        list_id: &str,
        subscriber_hash: &str,
    ) -> Result<AttributionSummary> {
        let seen = self
            .store
            .recorded_headlines(subscriber_hash)
            .await
            .with_context(|| format!("loading recorded clicks for {subscriber_hash}"))?
            .into_iter()
            .collect();
        Ok(self.attribute(list_id, subscriber_hash, seen).await)
    }

    /// `seen` holds headlines and slugs already recorded for this subscriber and
    /// grows as clicks are accepted; it is dropped when the run ends.
    ///
    /// `total_clicks` is overwritten with the number of rows inserted by this run,
    /// not incremented. It is left alone when the activity fetch fails.
    pub async fn attribute(
        &self,
        list_id: &str,
        subscriber_hash: &str,
        mut seen: HashSet<String>,
    ) -> AttributionSummary {
        let mut summary = AttributionSummary::new(subscriber_hash);

        let events = match self
            .activity
            .fetch_member_activity(list_id, subscriber_hash)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                warn!(list_id, subscriber_hash, error = %err, "activity fetch failed");
                summary.activity = ActivityStatus::FetchFailed;
                return summary;
            }
        };

        for event in events.iter().filter(|e| e.is_click()) {
            summary.clicks_seen += 1;
            let Some(slug) = event.url.as_deref().and_then(extract_slug) else {
                debug!(subscriber_hash, url = ?event.url, "click without a content slug");
                summary.skipped += 1;
                continue;
            };
            if seen.contains(&slug) {
                summary.skipped += 1;
                continue;
            }

            let headline = self.resolve_headline(list_id, &slug).await;
            if seen.contains(&headline) {
                summary.skipped += 1;
                continue;
            }

            match self
                .store
                .insert_click(&click_row(list_id, subscriber_hash, &headline, event))
                .await
            {
                Ok(_) => {
                    summary.processed += 1;
                    seen.insert(slug);
                    seen.insert(headline);
                }
                Err(err) => {
                    warn!(subscriber_hash, headline = %headline, error = %format!("{err:#}"), "click insert failed");
                    summary.errors += 1;
                }
            }
        }

        match self
            .store
            .set_total_clicks(subscriber_hash, list_id, summary.processed as i64)
            .await
        {
            Ok(()) => summary.total_clicks_updated = true,
            Err(err) => {
                warn!(subscriber_hash, error = %format!("{err:#}"), "updating total clicks failed");
                summary.errors += 1;
            }
        }

        debug!(
            subscriber_hash,
            processed = summary.processed,
            skipped = summary.skipped,
            errors = summary.errors,
            "subscriber attributed"
        );
        summary
    }

    /// Attribute the list's subscribers one at a time, highest prior click count first.
    pub async fn attribute_top(&self, list_id: &str, limit: i64) -> Result<AttributionRunSummary> {
        let subscribers = self
            .store
            .subscribers(&SubscriberQuery::top(limit).for_list(list_id))
            .await
            .with_context(|| format!("listing subscribers of {list_id}"))?;

        let mut run = AttributionRunSummary {
            list_id: list_id.to_string(),
            ..Default::default()
        };
        for subscriber in &subscribers {
            match self
                .attribute_subscriber(list_id, &subscriber.subscriber_hash)
                .await
            {
                Ok(one) => run.absorb(&one),
                Err(err) => {
                    warn!(subscriber_hash = %subscriber.subscriber_hash, error = %format!("{err:#}"), "attribution skipped");
                    run.subscribers += 1;
                    run.errors += 1;
                }
            }
        }

        info!(
            list_id,
            subscribers = run.subscribers,
            processed = run.processed,
            skipped = run.skipped,
            errors = run.errors,
            fetch_failures = run.fetch_failures,
            "attribution run finished"
        );
        Ok(run)
    }

    /// Unresolvable or failed lookups fall back to the raw slug.
    async fn resolve_headline(&self, list_id: &str, slug: &str) -> String {
        match self.headlines.resolve(list_id, slug).await {
            Ok(Some(title)) => title,
            Ok(None) => slug.to_string(),
            Err(err) => {
                warn!(list_id, slug, error = %err, "headline lookup failed; using slug");
                slug.to_string()
            }
        }
    }
}

fn click_row(
    list_id: &str,
    subscriber_hash: &str,
    headline: &str,
    event: &ActivityEvent,
) -> NewClickRecord {
    NewClickRecord {
        subscriber_hash: subscriber_hash.to_string(),
        clicked_headline: headline.to_string(),
        newsletter: list_id.to_string(),
        click_date: event.timestamp,
    }
}
