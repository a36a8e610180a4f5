//! WordPress REST lookups: slug -> rendered post title, one site per newsletter list.

use std::collections::HashMap;

use async_trait::async_trait;
use mbh_storage::{Auth, HttpFetcher};
use serde::Deserialize;

use crate::{decode_headline, HeadlineResolver, ProviderError};

/// `list_id` -> site base URL (e.g. `https://berkeleyside.org`).
#[derive(Debug, Clone, Default)]
pub struct ContentSites {
    sites: HashMap<String, String>,
}

impl ContentSites {
    pub fn new(sites: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            sites: sites
                .into_iter()
                .map(|(list_id, base)| (list_id, base.trim_end_matches('/').to_string()))
                .collect(),
        }
    }

    pub fn site_for(&self, list_id: &str) -> Option<&str> {
        self.sites.get(list_id).map(String::as_str)
    }

    pub fn posts_endpoint(&self, list_id: &str) -> Option<String> {
        self.site_for(list_id)
            .map(|base| format!("{base}/wp-json/wp/v2/posts"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WpPost {
    #[serde(default)]
    pub title: Option<WpRendered>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WpRendered {
    #[serde(default)]
    pub rendered: Option<String>,
}

/// First post's decoded title, or `None` when the slug matched nothing.
pub fn headline_from_posts(posts: Vec<WpPost>) -> Option<String> {
    posts
        .into_iter()
        .next()
        .and_then(|post| post.title)
        .and_then(|title| title.rendered)
        .map(|rendered| decode_headline(&rendered))
        .filter(|headline| !headline.is_empty())
}

pub struct WordPressResolver {
    http: HttpFetcher,
    sites: ContentSites,
}

impl WordPressResolver {
    pub fn new(http: HttpFetcher, sites: ContentSites) -> Self {
        Self { http, sites }
    }
}

#[async_trait]
impl HeadlineResolver for WordPressResolver {
    async fn resolve(&self, list_id: &str, slug: &str) -> Result<Option<String>, ProviderError> {
        let Some(endpoint) = self.sites.posts_endpoint(list_id) else {
            return Ok(None);
        };
        let query = [("slug", slug.to_string()), ("_fields", "title".to_string())];
        let posts: Vec<WpPost> = self.http.get_json(&endpoint, &query, &Auth::None).await?;
        Ok(headline_from_posts(posts))
    }
}
