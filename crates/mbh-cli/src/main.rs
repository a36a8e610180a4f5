use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use mbh_core::{ClickQuery, SubscriberQuery};
use mbh_sync::{
    connect_store, AppConfig, DraftOutcome, MembershipStore, NewsletterRegistry,
    PgMembershipStore, SyncOutcome, SyncPipeline,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mbh-cli")]
#[command(about = "Newsletter membership helper: roster sync, click attribution and email drafts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    #[command(subcommand)]
    Newsletters(NewsletterCommands),
    /// Fetch each roster from Mailchimp and reconcile it into the store.
    Sync {
        /// List ids to sync; defaults to every stored newsletter.
        #[arg(long = "list")]
        lists: Vec<String>,
    },
    /// Ingest click activity for one subscriber or the list's top subscribers.
    Attribute {
        #[arg(long = "list")]
        list_id: String,
        #[arg(long)]
        subscriber: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Browse subscribers by click count.
    Members {
        #[arg(long = "list")]
        list_id: Option<String>,
        #[arg(long, value_parser = parse_day)]
        created_after: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Show one subscriber with the headlines recorded for them.
    Member {
        #[arg(long)]
        subscriber: String,
    },
    /// Browse recorded clicks, newest first.
    Clicks {
        #[command(flatten)]
        filter: ClickFilter,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Most clicked headline in a date range.
    TopHeadline {
        #[command(flatten)]
        filter: ClickFilter,
    },
    /// Draft a fundraising email from a subscriber's click history.
    Draft {
        #[arg(long)]
        subscriber: String,
    },
}

#[derive(Debug, Subcommand)]
enum NewsletterCommands {
    Add {
        #[arg(long = "list")]
        list_id: String,
        /// Defaults to the name in the newsletter registry.
        #[arg(long)]
        name: Option<String>,
    },
    List {
        /// Also show the member count reported by Mailchimp.
        #[arg(long)]
        provider_stats: bool,
    },
}

#[derive(Debug, Args)]
struct ClickFilter {
    /// Inclusive start day, YYYY-MM-DD.
    #[arg(long, value_parser = parse_day)]
    start: Option<DateTime<Utc>>,
    /// Inclusive end day, YYYY-MM-DD.
    #[arg(long, value_parser = parse_day)]
    end: Option<DateTime<Utc>>,
    #[arg(long)]
    newsletter: Option<String>,
}

impl ClickFilter {
    fn query(self, limit: i64) -> ClickQuery {
        ClickQuery {
            start: self.start,
            end: self.end.map(end_of_day),
            newsletter: self.newsletter,
            limit,
        }
    }
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("expected YYYY-MM-DD: {err}"))?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid day {raw}"))
}

fn end_of_day(day: DateTime<Utc>) -> DateTime<Utc> {
    day + chrono::Duration::days(1) - chrono::Duration::seconds(1)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let store = connect_store(&config).await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Newsletters(NewsletterCommands::Add { list_id, name }) => {
            let name = match name {
                Some(name) => name,
                None => NewsletterRegistry::load(&config.newsletters_file)
                    .await?
                    .entry(&list_id)
                    .map(|entry| entry.name.clone())
                    .with_context(|| {
                        format!("no --name given and {list_id} is not in the newsletter registry")
                    })?,
            };
            if store.add_newsletter(&list_id, &name).await? {
                println!("added newsletter {list_id} ({name})");
            } else {
                bail!("newsletter {list_id} already exists");
            }
        }
        Commands::Newsletters(NewsletterCommands::List { provider_stats }) => {
            let pipeline = if provider_stats {
                Some(pipeline(&config, &store).await?)
            } else {
                None
            };
            for newsletter in store.list_newsletters().await? {
                let synced = newsletter
                    .last_synced
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let mut line = format!(
                    "{}  {}  subscribers={}  last_synced={}",
                    newsletter.list_id, newsletter.name, newsletter.subscriber_count, synced
                );
                if let Some(pipeline) = &pipeline {
                    match pipeline.provider_member_count(&newsletter.list_id).await {
                        Ok(count) => line.push_str(&format!("  provider={count}")),
                        Err(err) => warn!(list_id = %newsletter.list_id, error = %format!("{err:#}"), "provider stats unavailable"),
                    }
                }
                println!("{line}");
            }
        }
        Commands::Sync { lists } => {
            let pipeline = pipeline(&config, &store).await?;
            let lists = if lists.is_empty() {
                store
                    .list_newsletters()
                    .await?
                    .into_iter()
                    .map(|n| n.list_id)
                    .collect()
            } else {
                lists
            };
            if lists.is_empty() {
                bail!("no newsletters to sync; add one with `newsletters add`");
            }
            for list_id in &lists {
                match pipeline.sync_newsletter(list_id).await? {
                    SyncOutcome::Completed { summary, export } => {
                        println!(
                            "synced {}: fetched={} upserted={} marked_deleted={} failed_batches={}",
                            summary.list_id,
                            summary.fetched,
                            summary.upserted,
                            summary.marked_deleted,
                            summary.upsert_batches.failed + summary.delete_batches.failed
                        );
                        if !summary.newsletter_updated {
                            println!("  newsletter stats not recorded; is {} registered?", summary.list_id);
                        }
                        if let Some(path) = export {
                            println!("  roster exported to {path}");
                        }
                    }
                    SyncOutcome::FetchFailed { list_id, error } => {
                        warn!(list_id = %list_id, "roster fetch failed; nothing was changed");
                        println!("sync FAILED for {list_id}: {error} (retry later)");
                    }
                }
            }
        }
        Commands::Attribute {
            list_id,
            subscriber,
            limit,
        } => {
            let pipeline = pipeline(&config, &store).await?;
            if let Some(hash) = subscriber {
                let summary = pipeline.attribute_subscriber(&list_id, &hash).await?;
                println!(
                    "{hash}: processed={} skipped={} errors={}",
                    summary.processed, summary.skipped, summary.errors
                );
                if summary.activity == mbh_sync::ActivityStatus::FetchFailed {
                    warn!(subscriber_hash = %hash, "activity fetch failed; click count left unchanged");
                }
            } else {
                let run = pipeline.attribute_top_subscribers(&list_id, limit).await?;
                println!(
                    "{}: subscribers={} processed={} skipped={} errors={}",
                    run.list_id, run.subscribers, run.processed, run.skipped, run.errors
                );
                if run.fetch_failures > 0 {
                    warn!(
                        list_id = %run.list_id,
                        fetch_failures = run.fetch_failures,
                        "activity fetch failed for some subscribers"
                    );
                }
            }
        }
        Commands::Members {
            list_id,
            created_after,
            limit,
        } => {
            println!("total subscribers: {}", store.count_subscribers().await?);
            let mut query = SubscriberQuery::top(limit).created_after(created_after);
            if let Some(list_id) = list_id {
                query = query.for_list(list_id);
            }
            for s in store.subscribers(&query).await? {
                println!(
                    "{}  {}  clicks={}  lists={}  created={}",
                    s.subscriber_hash,
                    s.status,
                    s.total_clicks,
                    s.list_ids.join(","),
                    s.created_at
                        .map(|at| at.format("%Y-%m-%d").to_string())
                        .unwrap_or_default()
                );
            }
        }
        Commands::Member { subscriber } => {
            let Some(s) = store.subscriber(&subscriber).await? else {
                bail!("unknown subscriber {subscriber}");
            };
            println!(
                "{}  {}  clicks={}  lists={}",
                s.subscriber_hash,
                s.status,
                s.total_clicks,
                s.list_ids.join(",")
            );
            for headline in store.recorded_headlines(&s.subscriber_hash).await? {
                println!("  {headline}");
            }
        }
        Commands::Clicks { filter, limit } => {
            for c in store.click_activity(&filter.query(limit)).await? {
                println!(
                    "{}  {}  {}  {}",
                    c.click_date
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default(),
                    c.newsletter,
                    c.subscriber_hash,
                    c.clicked_headline
                );
            }
        }
        Commands::TopHeadline { filter } => {
            match store.most_popular_headline(&filter.query(1)).await? {
                Some(top) => println!("{} ({} clicks)", top.clicked_headline, top.click_count),
                None => println!("no clicks in range"),
            }
        }
        Commands::Draft { subscriber } => {
            let pipeline = pipeline(&config, &store).await?;
            match pipeline.draft_email(&subscriber).await? {
                DraftOutcome::NoClickActivity => {
                    println!("no click activity recorded for {subscriber}")
                }
                DraftOutcome::Drafted { headlines, email } => {
                    println!("topics: {}\n\n{email}", headlines.join(", "));
                }
            }
        }
    }

    Ok(())
}

async fn pipeline(config: &AppConfig, store: &Arc<PgMembershipStore>) -> Result<SyncPipeline> {
    SyncPipeline::new(config, store.clone())
        .await
        .context("building sync pipeline")
}
