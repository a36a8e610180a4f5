//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mbh_adapters::{
    ActivitySource, CompletionClient, HeadlineResolver, ProviderError, RosterSource,
};
use mbh_core::{
    ActivityEvent, ClickQuery, ClickRecord, HeadlineCount, NewClickRecord, Newsletter,
    RosterMember, Subscriber, SubscriberQuery, SubscriberStatus, SubscriberUpsert,
};
use mbh_storage::FetchError;

use crate::store::MembershipStore;

pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0)
        .single()
        .expect("valid test date")
}

pub fn member(hash: &str) -> RosterMember {
    RosterMember {
        subscriber_hash: hash.to_string(),
        opted_in_at: Some(ts(1)),
    }
}

pub fn click(url: &str) -> ActivityEvent {
    ActivityEvent {
        action: "click".to_string(),
        url: Some(url.to_string()),
        timestamp: Some(ts(2)),
    }
}

pub fn open() -> ActivityEvent {
    ActivityEvent {
        action: "open".to_string(),
        url: None,
        timestamp: Some(ts(2)),
    }
}

fn unavailable(url: &str) -> ProviderError {
    ProviderError::Fetch(FetchError::HttpStatus {
        status: 503,
        url: url.to_string(),
    })
}

#[derive(Default)]
pub struct FakeProvider {
    rosters: HashMap<String, Vec<RosterMember>>,
    activity: HashMap<String, Vec<ActivityEvent>>,
    failing_activity: HashSet<String>,
    fail_roster_at: Option<usize>,
    offsets: Mutex<Vec<usize>>,
    activity_requests: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn with_roster(list_id: &str, members: impl IntoIterator<Item = RosterMember>) -> Self {
        let mut provider = Self::default();
        provider
            .rosters
            .insert(list_id.to_string(), members.into_iter().collect());
        provider
    }

    pub fn failing_roster_at_offset(mut self, offset: usize) -> Self {
        self.fail_roster_at = Some(offset);
        self
    }

    pub fn with_activity(mut self, subscriber_hash: &str, events: Vec<ActivityEvent>) -> Self {
        self.activity.insert(subscriber_hash.to_string(), events);
        self
    }

    pub fn failing_activity_for(mut self, subscriber_hash: &str) -> Self {
        self.failing_activity.insert(subscriber_hash.to_string());
        self
    }

    pub fn page_offsets(&self) -> Vec<usize> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn activity_requests(&self) -> Vec<String> {
        self.activity_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RosterSource for FakeProvider {
    async fn fetch_members_page(
        &self,
        list_id: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<RosterMember>, ProviderError> {
        self.offsets.lock().unwrap().push(offset);
        if self.fail_roster_at == Some(offset) {
            return Err(unavailable("members"));
        }
        let members = self.rosters.get(list_id).cloned().unwrap_or_default();
        Ok(members.into_iter().skip(offset).take(count).collect())
    }

    async fn list_member_count(&self, list_id: &str) -> Result<u64, ProviderError> {
        Ok(self.rosters.get(list_id).map(|m| m.len() as u64).unwrap_or(0))
    }
}

#[async_trait]
impl ActivitySource for FakeProvider {
    async fn fetch_member_activity(
        &self,
        _list_id: &str,
        subscriber_hash: &str,
    ) -> Result<Vec<ActivityEvent>, ProviderError> {
        self.activity_requests
            .lock()
            .unwrap()
            .push(subscriber_hash.to_string());
        if self.failing_activity.contains(subscriber_hash) {
            return Err(unavailable("activity"));
        }
        Ok(self.activity.get(subscriber_hash).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeResolver {
    titles: HashMap<String, String>,
    failing: HashSet<String>,
    lookups: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn with_titles<'a>(titles: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            titles: titles
                .into_iter()
                .map(|(slug, title)| (slug.to_string(), title.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing_for(mut self, slug: &str) -> Self {
        self.failing.insert(slug.to_string());
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl HeadlineResolver for FakeResolver {
    async fn resolve(&self, _list_id: &str, slug: &str) -> Result<Option<String>, ProviderError> {
        self.lookups.lock().unwrap().push(slug.to_string());
        if self.failing.contains(slug) {
            return Err(unavailable("posts"));
        }
        Ok(self.titles.get(slug).cloned())
    }
}

#[derive(Default)]
pub struct FakeCompletion {
    reply: Option<String>,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeCompletion {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        self.requests
            .lock()
            .unwrap()
            .push((system.to_string(), prompt.to_string()));
        self.reply.clone().ok_or(ProviderError::EmptyCompletion)
    }
}

#[derive(Default)]
struct MemoryState {
    newsletters: BTreeMap<String, Newsletter>,
    subscribers: BTreeMap<String, Subscriber>,
    clicks: Vec<ClickRecord>,
    mark_deleted_calls: usize,
    fail_mark_deleted_calls: HashSet<usize>,
    fail_headlines: HashSet<String>,
    fail_total_clicks: bool,
}

/// Store double with the same observable semantics as the Postgres store, plus fault injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn seed_subscriber(&self, hash: &str, lists: &[&str], status: SubscriberStatus) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.insert(
            hash.to_string(),
            Subscriber {
                subscriber_hash: hash.to_string(),
                status,
                list_ids: lists.iter().map(|l| l.to_string()).collect(),
                created_at: Some(ts(1)),
                total_clicks: 0,
            },
        );
    }

    pub fn seed_clicks(&self, hash: &str, total_clicks: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(sub) = state.subscribers.get_mut(hash) {
            sub.total_clicks = total_clicks;
        }
    }

    pub fn seed_click(&self, hash: &str, list_id: &str, headline: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.clicks.len() as i64 + 1;
        state.clicks.push(ClickRecord {
            id,
            subscriber_hash: hash.to_string(),
            clicked_headline: headline.to_string(),
            newsletter: list_id.to_string(),
            click_date: Some(ts(1)),
        });
    }

    /// Fail the n-th (zero-based) `mark_deleted` call.
    pub fn fail_mark_deleted_call(&self, call_index: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_mark_deleted_calls
            .insert(call_index);
    }

    pub fn fail_insert_of(&self, headline: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_headlines
            .insert(headline.to_string());
    }

    pub fn fail_total_clicks(&self) {
        self.state.lock().unwrap().fail_total_clicks = true;
    }

    pub fn snapshot(&self, hash: &str) -> Option<Subscriber> {
        self.state.lock().unwrap().subscribers.get(hash).cloned()
    }

    pub fn status_of(&self, hash: &str) -> Option<SubscriberStatus> {
        self.snapshot(hash).map(|s| s.status)
    }

    pub fn clicks_for(&self, hash: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .clicks
            .iter()
            .filter(|c| c.subscriber_hash == hash)
            .map(|c| c.clicked_headline.clone())
            .collect()
    }

    pub fn mark_deleted_calls(&self) -> usize {
        self.state.lock().unwrap().mark_deleted_calls
    }

    fn click_matches(click: &ClickRecord, query: &ClickQuery) -> bool {
        let after_start = match (query.start, click.click_date) {
            (Some(start), Some(at)) => at >= start,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let before_end = match (query.end, click.click_date) {
            (Some(end), Some(at)) => at <= end,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let newsletter = query
            .newsletter
            .as_deref()
            .map_or(true, |n| click.newsletter == n);
        after_start && before_end && newsletter
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn list_newsletters(&self) -> Result<Vec<Newsletter>> {
        let mut out = self
            .state
            .lock()
            .unwrap()
            .newsletters
            .values()
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn newsletter(&self, list_id: &str) -> Result<Option<Newsletter>> {
        Ok(self.state.lock().unwrap().newsletters.get(list_id).cloned())
    }

    async fn add_newsletter(&self, list_id: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.newsletters.contains_key(list_id) {
            return Ok(false);
        }
        state.newsletters.insert(
            list_id.to_string(),
            Newsletter {
                list_id: list_id.to_string(),
                name: name.to_string(),
                subscriber_count: 0,
                last_synced: None,
            },
        );
        Ok(true)
    }

    async fn record_newsletter_sync(
        &self,
        list_id: &str,
        subscriber_count: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(newsletter) = state.newsletters.get_mut(list_id) else {
            return Ok(false);
        };
        newsletter.subscriber_count = subscriber_count;
        newsletter.last_synced = Some(synced_at);
        Ok(true)
    }

    async fn subscriber_hashes_for_list(&self, list_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscribers
            .values()
            .filter(|s| s.status == SubscriberStatus::Subscribed && s.is_member_of(list_id))
            .map(|s| s.subscriber_hash.clone())
            .collect())
    }

    async fn upsert_subscribers(&self, rows: &[SubscriberUpsert]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            let entry = state
                .subscribers
                .entry(row.subscriber_hash.clone())
                .or_insert_with(|| Subscriber {
                    subscriber_hash: row.subscriber_hash.clone(),
                    status: SubscriberStatus::Subscribed,
                    list_ids: Vec::new(),
                    created_at: None,
                    total_clicks: 0,
                });
            entry.status = SubscriberStatus::Subscribed;
            if !entry.is_member_of(&row.list_id) {
                entry.list_ids.push(row.list_id.clone());
            }
            if row.created_at.is_some() {
                entry.created_at = row.created_at;
            }
        }
        Ok(rows.len() as u64)
    }

    async fn mark_deleted(&self, hashes: &[String]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let call = state.mark_deleted_calls;
        state.mark_deleted_calls += 1;
        if state.fail_mark_deleted_calls.contains(&call) {
            bail!("injected failure on mark_deleted call {call}");
        }
        let mut changed = 0;
        for hash in hashes {
            if let Some(sub) = state.subscribers.get_mut(hash) {
                if sub.status != SubscriberStatus::Deleted {
                    sub.status = SubscriberStatus::Deleted;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn count_subscribers(&self) -> Result<i64> {
        Ok(self.state.lock().unwrap().subscribers.len() as i64)
    }

    async fn subscribers(&self, query: &SubscriberQuery) -> Result<Vec<Subscriber>> {
        let mut out = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .values()
            .filter(|s| query.list_id.as_deref().map_or(true, |l| s.is_member_of(l)))
            .filter(|s| match (query.created_after, s.created_at) {
                (Some(after), Some(at)) => at >= after,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.total_clicks
                .cmp(&a.total_clicks)
                .then_with(|| a.subscriber_hash.cmp(&b.subscriber_hash))
        });
        out.truncate(query.limit.max(1) as usize);
        Ok(out)
    }

    async fn subscriber(&self, subscriber_hash: &str) -> Result<Option<Subscriber>> {
        Ok(self.snapshot(subscriber_hash))
    }

    async fn recorded_headlines(&self, subscriber_hash: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        Ok(self
            .clicks_for(subscriber_hash)
            .into_iter()
            .filter(|h| seen.insert(h.clone()))
            .collect())
    }

    async fn insert_click(&self, click: &NewClickRecord) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_headlines.contains(&click.clicked_headline) {
            bail!("injected failure inserting {}", click.clicked_headline);
        }
        let id = state.clicks.len() as i64 + 1;
        state.clicks.push(ClickRecord {
            id,
            subscriber_hash: click.subscriber_hash.clone(),
            clicked_headline: click.clicked_headline.clone(),
            newsletter: click.newsletter.clone(),
            click_date: click.click_date,
        });
        Ok(id)
    }

    async fn set_total_clicks(
        &self,
        subscriber_hash: &str,
        list_id: &str,
        total: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_total_clicks {
            bail!("injected failure updating total clicks");
        }
        state
            .subscribers
            .entry(subscriber_hash.to_string())
            .or_insert_with(|| Subscriber {
                subscriber_hash: subscriber_hash.to_string(),
                status: SubscriberStatus::Subscribed,
                list_ids: vec![list_id.to_string()],
                created_at: None,
                total_clicks: 0,
            })
            .total_clicks = total;
        Ok(())
    }

    async fn click_activity(&self, query: &ClickQuery) -> Result<Vec<ClickRecord>> {
        let mut out = self
            .state
            .lock()
            .unwrap()
            .clicks
            .iter()
            .filter(|c| Self::click_matches(c, query))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.click_date.cmp(&a.click_date).then(b.id.cmp(&a.id)));
        out.truncate(query.limit.max(1) as usize);
        Ok(out)
    }

    async fn most_popular_headline(&self, query: &ClickQuery) -> Result<Option<HeadlineCount>> {
        let mut counts = BTreeMap::<String, i64>::new();
        for c in self.state.lock().unwrap().clicks.iter() {
            if Self::click_matches(c, query) {
                *counts.entry(c.clicked_headline.clone()).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(clicked_headline, click_count)| HeadlineCount {
                clicked_headline,
                click_count,
            }))
    }
}
