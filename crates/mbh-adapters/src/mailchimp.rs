//! Mailchimp Marketing API v3 client for rosters, list stats and member activity.

use async_trait::async_trait;
use mbh_core::{ActivityEvent, RosterMember};
use mbh_storage::{Auth, HttpFetcher};
use serde::Deserialize;
use tracing::debug;

use crate::{parse_provider_timestamp, ActivitySource, ProviderError, RosterSource};

/// Projection requested for roster pages; keeps page payloads small.
pub const MEMBER_FIELDS: &str = "members.id,members.status,members.timestamp_opt,total_items";

#[derive(Debug, Clone)]
pub struct MailchimpConfig {
    pub api_key: String,
    pub server_prefix: String,
    /// Overrides `https://{server_prefix}.api.mailchimp.com/3.0`.
    pub base_url: Option<String>,
}

impl MailchimpConfig {
    /// Keys look like `<secret>-us2`; the suffix names the data centre.
    pub fn from_api_key(api_key: impl Into<String>, server_prefix: Option<String>) -> Self {
        let api_key = api_key.into();
        let server_prefix = server_prefix
            .filter(|p| !p.trim().is_empty())
            .or_else(|| {
                api_key
                    .rsplit_once('-')
                    .map(|(_, dc)| dc.to_string())
                    .filter(|dc| !dc.is_empty())
            })
            .unwrap_or_else(|| "us2".to_string());
        Self {
            api_key,
            server_prefix,
            base_url: None,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.api.mailchimp.com/3.0", self.server_prefix))
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembersPage {
    #[serde(default)]
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp_opt: Option<String>,
}

impl MemberRecord {
    pub fn into_roster_member(self) -> RosterMember {
        RosterMember {
            opted_in_at: self.timestamp_opt.as_deref().and_then(parse_provider_timestamp),
            subscriber_hash: self.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListInfo {
    #[serde(default)]
    pub stats: Option<ListStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListStats {
    #[serde(default)]
    pub member_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberActivity {
    #[serde(default)]
    pub activity: Vec<ActivityRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityRecord {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MemberActivity {
    pub fn into_events(self) -> Vec<ActivityEvent> {
        self.activity
            .into_iter()
            .map(|record| ActivityEvent {
                action: record.action,
                url: record.url.filter(|u| !u.trim().is_empty()),
                timestamp: record.timestamp.as_deref().and_then(parse_provider_timestamp),
            })
            .collect()
    }
}

pub struct MailchimpClient {
    http: HttpFetcher,
    base_url: String,
    auth: Auth,
}

impl MailchimpClient {
    pub fn new(http: HttpFetcher, config: &MailchimpConfig) -> Result<Self, ProviderError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "MAILCHIMP_API_KEY not set".to_string(),
            ));
        }
        Ok(Self {
            http,
            base_url: config.base_url(),
            auth: Auth::Basic {
                username: "anystring".to_string(),
                password: config.api_key.clone(),
            },
        })
    }
}

#[async_trait]
impl RosterSource for MailchimpClient {
    async fn fetch_members_page(
        &self,
        list_id: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<RosterMember>, ProviderError> {
        let url = format!("{}/lists/{list_id}/members", self.base_url);
        let query = [
            ("count", count.to_string()),
            ("offset", offset.to_string()),
            ("status", "subscribed".to_string()),
            ("fields", MEMBER_FIELDS.to_string()),
        ];
        let page: MembersPage = self.http.get_json(&url, &query, &self.auth).await?;
        debug!(
            list_id,
            offset,
            returned = page.members.len(),
            total_items = ?page.total_items,
            "fetched roster page"
        );
        Ok(page
            .members
            .into_iter()
            .map(MemberRecord::into_roster_member)
            .collect())
    }

    async fn list_member_count(&self, list_id: &str) -> Result<u64, ProviderError> {
        let url = format!("{}/lists/{list_id}", self.base_url);
        let query = [("fields", "stats.member_count".to_string())];
        let info: ListInfo = self.http.get_json(&url, &query, &self.auth).await?;
        Ok(info.stats.and_then(|s| s.member_count).unwrap_or(0))
    }
}

#[async_trait]
impl ActivitySource for MailchimpClient {
    async fn fetch_member_activity(
        &self,
        list_id: &str,
        subscriber_hash: &str,
    ) -> Result<Vec<ActivityEvent>, ProviderError> {
        let url = format!(
            "{}/lists/{list_id}/members/{subscriber_hash}/activity",
            self.base_url
        );
        let activity: MemberActivity = self.http.get_json(&url, &[], &self.auth).await?;
        Ok(activity.into_events())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbh_storage::HttpClientConfig;

    #[test]
    fn server_prefix_falls_back_to_key_suffix() {
        let cfg = MailchimpConfig::from_api_key("0123abcd-us21", None);
        assert_eq!(cfg.server_prefix, "us21");
        assert_eq!(cfg.base_url(), "https://us21.api.mailchimp.com/3.0");

        let explicit = MailchimpConfig::from_api_key("0123abcd-us21", Some("us2".into()));
        assert_eq!(explicit.server_prefix, "us2");

        let bare = MailchimpConfig::from_api_key("0123abcd", None);
        assert_eq!(bare.server_prefix, "us2");
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let mut cfg = MailchimpConfig::from_api_key("k-us2", None);
        cfg.base_url = Some("http://127.0.0.1:9000/3.0/".into());
        assert_eq!(cfg.base_url(), "http://127.0.0.1:9000/3.0");
    }

    #[test]
    fn empty_key_is_a_configuration_error() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let cfg = MailchimpConfig::from_api_key("", None);
        assert!(matches!(
            MailchimpClient::new(http, &cfg),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[test]
    fn activity_without_log_is_empty() {
        let parsed: MemberActivity = serde_json::from_str("{}").unwrap();
        assert!(parsed.into_events().is_empty());
    }

    #[test]
    fn members_map_to_roster_with_optional_opt_in() {
        let page: MembersPage = serde_json::from_str(
            r#"{"members":[{"id":"aaa","status":"subscribed","timestamp_opt":""},
                           {"id":"bbb","timestamp_opt":"2022-01-02T03:04:05+00:00"}]}"#,
        )
        .unwrap();
        let roster = page
            .members
            .into_iter()
            .map(MemberRecord::into_roster_member)
            .collect::<Vec<_>>();
        assert_eq!(roster[0].subscriber_hash, "aaa");
        assert!(roster[0].opted_in_at.is_none());
        assert!(roster[1].opted_in_at.is_some());
    }
}
