//! Sync engine: roster reconciliation, click attribution and email drafting over a membership store.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mbh_adapters::{
    ActivitySource, ChatCompletionClient, CompletionClient, HeadlineResolver, MailchimpClient,
    RosterSource, WordPressResolver,
};
use mbh_storage::{ExportStore, HttpFetcher};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

pub mod attribution;
pub mod config;
pub mod drafting;
pub mod reconcile;
pub mod roster;
pub mod store;

#[cfg(test)]
mod testing;

pub use attribution::{
    ActivityStatus, AttributionRunSummary, AttributionSummary, ClickAttributor,
};
pub use config::{AppConfig, NewsletterEntry, NewsletterRegistry};
pub use drafting::{DraftOutcome, EmailDrafter};
pub use reconcile::{plan_reconciliation, BatchTally, ReconcilePlan, ReconcileSummary, Reconciler};
pub use roster::{Roster, RosterFetcher};
pub use store::{MembershipStore, PgMembershipStore};

pub const CRATE_NAME: &str = "mbh-sync";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed {
        summary: ReconcileSummary,
        export: Option<String>,
    },
    /// The roster fetch failed; nothing was written.
    FetchFailed { list_id: String, error: String },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub page_size: usize,
    pub delete_batch_size: usize,
    pub exports: Option<ExportStore>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: roster::DEFAULT_PAGE_SIZE,
            delete_batch_size: reconcile::DEFAULT_BATCH_SIZE,
            exports: None,
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn MembershipStore>,
    roster: Arc<dyn RosterSource>,
    activity: Arc<dyn ActivitySource>,
    headlines: Arc<dyn HeadlineResolver>,
    completion: Option<Arc<dyn CompletionClient>>,
    settings: PipelineSettings,
}

impl SyncPipeline {
    /// Wire the Mailchimp, WordPress and (when a key is set) chat-completion clients.
    pub async fn new(config: &AppConfig, store: Arc<dyn MembershipStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client())?;
        let mailchimp = Arc::new(
            MailchimpClient::new(http.clone(), &config.mailchimp())
                .context("configuring Mailchimp client")?,
        );
        let registry = NewsletterRegistry::load(&config.newsletters_file).await?;
        let headlines = Arc::new(WordPressResolver::new(
            http.clone(),
            registry.content_sites(),
        ));
        let completion = if config.openai_api_key.trim().is_empty() {
            None
        } else {
            let client = ChatCompletionClient::new(http, config.completion())
                .context("configuring chat-completion client")?;
            Some(Arc::new(client) as Arc<dyn CompletionClient>)
        };
        let settings = PipelineSettings {
            page_size: config.roster_page_size,
            delete_batch_size: config.delete_batch_size,
            exports: config
                .export_rosters
                .then(|| ExportStore::new(config.exports_dir.clone())),
        };

        Ok(Self::from_parts(
            store,
            mailchimp.clone(),
            mailchimp,
            headlines,
            completion,
            settings,
        ))
    }

    pub fn from_parts(
        store: Arc<dyn MembershipStore>,
        roster: Arc<dyn RosterSource>,
        activity: Arc<dyn ActivitySource>,
        headlines: Arc<dyn HeadlineResolver>,
        completion: Option<Arc<dyn CompletionClient>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            roster,
            activity,
            headlines,
            completion,
            settings,
        }
    }

    pub fn store(&self) -> &dyn MembershipStore {
        self.store.as_ref()
    }

    /// Fetch the full roster, then reconcile. The reconciler only runs on a complete fetch.
    pub async fn sync_newsletter(&self, list_id: &str) -> Result<SyncOutcome> {
        self.fetch_and_reconcile(list_id)
            .instrument(info_span!("sync_newsletter", list_id))
            .await
    }

    async fn fetch_and_reconcile(&self, list_id: &str) -> Result<SyncOutcome> {
        let fetched = RosterFetcher::new(self.roster.as_ref(), self.settings.page_size)
            .fetch(list_id)
            .await;
        let roster = match fetched {
            Ok(roster) => roster,
            Err(err) => {
                warn!(list_id, error = %err, "roster fetch failed; store left untouched");
                return Ok(SyncOutcome::FetchFailed {
                    list_id: list_id.to_string(),
                    error: err.to_string(),
                });
            }
        };
        info!(list_id, members = roster.len(), pages = roster.pages(), "roster fetched");

        let export = self.export_roster(&roster).await;
        let summary = Reconciler::new(self.store.as_ref(), self.settings.delete_batch_size)
            .reconcile(&roster)
            .await?;
        Ok(SyncOutcome::Completed { summary, export })
    }

    pub async fn attribute_subscriber(
        &self,
        list_id: &str,
        subscriber_hash: &str,
    ) -> Result<AttributionSummary> {
        self.attributor()
            .attribute_subscriber(list_id, subscriber_hash)
            .instrument(info_span!("attribute", list_id, subscriber_hash))
            .await
    }

    pub async fn attribute_top_subscribers(
        &self,
        list_id: &str,
        limit: i64,
    ) -> Result<AttributionRunSummary> {
        self.attributor().attribute_top(list_id, limit).await
    }

    pub async fn provider_member_count(&self, list_id: &str) -> Result<u64> {
        self.roster
            .list_member_count(list_id)
            .await
            .with_context(|| format!("reading provider stats for {list_id}"))
    }

    pub async fn draft_email(&self, subscriber_hash: &str) -> Result<DraftOutcome> {
        let completion = self
            .completion
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set; email drafting is unavailable"))?;
        EmailDrafter::new(self.store.as_ref(), completion)
            .draft_for_subscriber(subscriber_hash)
            .await
    }

    fn attributor(&self) -> ClickAttributor<'_> {
        ClickAttributor::new(
            self.activity.as_ref(),
            self.headlines.as_ref(),
            self.store.as_ref(),
        )
    }

    async fn export_roster(&self, roster: &Roster) -> Option<String> {
        let exports = self.settings.exports.as_ref()?;
        match exports
            .store_json(Utc::now(), roster.list_id(), roster)
            .await
        {
            Ok(stored) => Some(stored.absolute_path.display().to_string()),
            Err(err) => {
                warn!(list_id = roster.list_id(), error = %format!("{err:#}"), "roster export failed");
                None
            }
        }
    }
}

pub async fn connect_store(config: &AppConfig) -> Result<Arc<PgMembershipStore>> {
    let store = PgMembershipStore::connect(&config.database_url).await?;
    Ok(Arc::new(store))
}
