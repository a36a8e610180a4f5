//! Upstream collaborator contracts + HTTP-backed implementations.
//!
//! The engine only sees the traits in this module; the email-marketing provider,
//! the content system and the text-completion API are wired in behind them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use mbh_core::{ActivityEvent, RosterMember};
use mbh_storage::FetchError;
use percent_encoding::percent_decode_str;
use scraper::Html;
use thiserror::Error;
use url::Url;

pub mod completion;
pub mod mailchimp;
pub mod wordpress;

pub use completion::{ChatCompletionClient, ChatCompletionConfig};
pub use mailchimp::{MailchimpClient, MailchimpConfig};
pub use wordpress::{ContentSites, WordPressResolver};

pub const CRATE_NAME: &str = "mbh-adapters";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("completion response carried no content")]
    EmptyCompletion,
}

/// Paged read access to a provider's list members and list statistics.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// One page of currently subscribed members, starting at `offset`.
    async fn fetch_members_page(
        &self,
        list_id: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<RosterMember>, ProviderError>;

    async fn list_member_count(&self, list_id: &str) -> Result<u64, ProviderError>;
}

#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Raw activity log for one subscriber. An absent log is an empty vector, not an error.
    async fn fetch_member_activity(
        &self,
        list_id: &str,
        subscriber_hash: &str,
    ) -> Result<Vec<ActivityEvent>, ProviderError>;
}

/// Maps a content slug to a human-readable headline for the site behind `list_id`.
#[async_trait]
pub trait HeadlineResolver: Send + Sync {
    async fn resolve(&self, list_id: &str, slug: &str) -> Result<Option<String>, ProviderError>;
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError>;
}

/// Pull the content slug out of a clicked link.
///
/// Tracking links carry the real destination in a `url` query parameter; when
/// present its final path segment wins. Otherwise the final path segment of the
/// link itself is used. The nested target is percent-decoded once more after
/// query parsing (some senders double-encode it), and the returned segment is
/// percent-decoded.
pub fn extract_slug(link: &str) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }

    let Ok(parsed) = Url::parse(link) else {
        return last_path_segment(strip_query(link));
    };

    if let Some((_, nested)) = parsed.query_pairs().find(|(key, _)| key == "url") {
        let target = percent_decode_str(&nested).decode_utf8_lossy().into_owned();
        return match Url::parse(&target) {
            Ok(target) => last_path_segment(target.path()),
            Err(_) => last_path_segment(strip_query(&target)),
        };
    }

    last_path_segment(parsed.path())
}

fn strip_query(link: &str) -> &str {
    link.split(['?', '#']).next().unwrap_or(link)
}

fn last_path_segment(path: &str) -> Option<String> {
    path.trim_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
}

/// Decode HTML entities in a rendered title.
///
/// Inline markup such as `<em>` is dropped and the ends are trimmed; interior
/// whitespace is kept as-is, so `&nbsp;` survives as U+00A0.
pub fn decode_headline(rendered: &str) -> String {
    let fragment = Html::parse_fragment(rendered);
    let text = fragment.root_element().text().collect::<String>();
    text.trim().to_string()
}

/// Provider timestamps arrive as RFC 3339, as `YYYY-MM-DD HH:MM:SS`, or as an empty string.
pub fn parse_provider_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
