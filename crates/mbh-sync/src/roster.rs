//! Roster Fetcher: pages a provider list into one in-memory snapshot.

use std::collections::HashSet;

use mbh_adapters::{ProviderError, RosterSource};
use mbh_core::RosterMember;
use serde::Serialize;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Complete set of subscribed members for one list at one point in time.
///
/// Only produced by a fetch that ran to completion; a failed fetch never yields a
/// (partial or empty) `Roster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roster {
    list_id: String,
    members: Vec<RosterMember>,
    pages: usize,
}

impl Roster {
    pub fn new(list_id: impl Into<String>, members: Vec<RosterMember>) -> Self {
        Self {
            list_id: list_id.into(),
            members,
            pages: 1,
        }
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn members(&self) -> &[RosterMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn hashes(&self) -> HashSet<&str> {
        self.members
            .iter()
            .map(|m| m.subscriber_hash.as_str())
            .collect()
    }
}

pub struct RosterFetcher<'a> {
    source: &'a dyn RosterSource,
    page_size: usize,
}

impl<'a> RosterFetcher<'a> {
    pub fn new(source: &'a dyn RosterSource, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    /// Request pages at increasing offsets until a page comes back short.
    ///
    /// A list whose size is an exact multiple of the page size costs one extra
    /// request that returns an empty page. Any provider error aborts the whole
    /// fetch.
    pub async fn fetch(&self, list_id: &str) -> Result<Roster, ProviderError> {
        let mut members = Vec::new();
        let mut offset = 0usize;
        let mut pages = 0usize;

        loop {
            let page = self
                .source
                .fetch_members_page(list_id, self.page_size, offset)
                .instrument(info_span!("roster_page", list_id, offset))
                .await?;
            pages += 1;
            let returned = page.len();
            members.extend(page);
            debug!(list_id, offset, returned, total = members.len(), "roster page");

            if returned < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(Roster {
            list_id: list_id.to_string(),
            members,
            pages,
        })
    }
}
