//! Reconciler: applies the difference between the stored and freshly fetched roster of one list.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use mbh_core::SubscriberUpsert;
use serde::Serialize;
use tracing::{info, warn};

use crate::roster::Roster;
use crate::store::MembershipStore;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// What a reconciliation will write, computed without touching the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub list_id: String,
    pub upserts: Vec<SubscriberUpsert>,
    /// `stored - fresh`, in stored order.
    pub to_delete: Vec<String>,
}

pub fn plan_reconciliation(stored: &[String], roster: &Roster) -> ReconcilePlan {
    let list_id = roster.list_id().to_string();
    let fresh = roster.hashes();

    let mut upserted: HashSet<&str> = HashSet::new();
    let mut upserts = Vec::with_capacity(roster.len());
    for m in roster.members() {
        if upserted.insert(m.subscriber_hash.as_str()) {
            upserts.push(SubscriberUpsert {
                subscriber_hash: m.subscriber_hash.clone(),
                list_id: list_id.clone(),
                created_at: m.opted_in_at,
            });
        }
    }

    let mut considered: HashSet<&str> = HashSet::new();
    let mut to_delete = Vec::new();
    for hash in stored {
        if considered.insert(hash.as_str()) && !fresh.contains(hash.as_str()) {
            to_delete.push(hash.clone());
        }
    }

    ReconcilePlan {
        list_id,
        upserts,
        to_delete,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTally {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub list_id: String,
    pub fetched: usize,
    pub upserted: u64,
    pub upsert_batches: BatchTally,
    pub planned_deletions: usize,
    pub marked_deleted: u64,
    pub delete_batches: BatchTally,
    pub newsletter_updated: bool,
}

impl ReconcileSummary {
    pub fn is_clean(&self) -> bool {
        self.upsert_batches.failed == 0 && self.delete_batches.failed == 0 && self.newsletter_updated
    }
}

pub struct Reconciler<'a> {
    store: &'a dyn MembershipStore,
    batch_size: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn MembershipStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Persist a completed roster fetch. Batch failures are tallied, not raised.
    ///
    /// Only an unreadable stored roster aborts, and it does so before anything is written.
    pub async fn reconcile(&self, roster: &Roster) -> Result<ReconcileSummary> {
        let list_id = roster.list_id();
        let stored = self
            .store
            .subscriber_hashes_for_list(list_id)
            .await
            .with_context(|| format!("reading stored roster for {list_id}"))?;
        let plan = plan_reconciliation(&stored, roster);
        info!(
            list_id,
            stored = stored.len(),
            fetched = roster.len(),
            to_delete = plan.to_delete.len(),
            "reconciling roster"
        );

        let mut upserted = 0u64;
        let mut upsert_batches = BatchTally::default();
        for (index, batch) in plan.upserts.chunks(self.batch_size).enumerate() {
            match self.store.upsert_subscribers(batch).await {
                Ok(n) => {
                    upserted += n;
                    upsert_batches.succeeded += 1;
                }
                Err(err) => {
                    warn!(list_id, batch = index + 1, error = %format!("{err:#}"), "upsert batch failed");
                    upsert_batches.failed += 1;
                }
            }
        }

        let mut marked_deleted = 0u64;
        let mut delete_batches = BatchTally::default();
        for (index, batch) in plan.to_delete.chunks(self.batch_size).enumerate() {
            match self.store.mark_deleted(batch).await {
                Ok(n) => {
                    marked_deleted += n;
                    delete_batches.succeeded += 1;
                }
                Err(err) => {
                    warn!(list_id, batch = index + 1, error = %format!("{err:#}"), "mark-deleted batch failed");
                    delete_batches.failed += 1;
                }
            }
        }

        let newsletter_updated = match self
            .store
            .record_newsletter_sync(list_id, roster.len() as i64, Utc::now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(list_id, "newsletter not registered; sync stats not recorded");
                false
            }
            Err(err) => {
                warn!(list_id, error = %format!("{err:#}"), "updating newsletter sync stats failed");
                false
            }
        };

        let summary = ReconcileSummary {
            list_id: list_id.to_string(),
            fetched: roster.len(),
            upserted,
            upsert_batches,
            planned_deletions: plan.to_delete.len(),
            marked_deleted,
            delete_batches,
            newsletter_updated,
        };
        info!(
            list_id,
            upserted = summary.upserted,
            marked_deleted = summary.marked_deleted,
            failed_batches = summary.upsert_batches.failed + summary.delete_batches.failed,
            "roster reconciled"
        );
        Ok(summary)
    }
}
