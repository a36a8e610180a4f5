//! Fundraising email drafts built from a subscriber's click history.

use anyhow::{Context, Result};
use mbh_adapters::CompletionClient;
use serde::Serialize;
use tracing::info;

use crate::store::MembershipStore;

pub const FUNDRAISING_BRIEF: &str = "You are an email fundraiser for a nonprofit news \
organization in the San Francisco Bay Area. Write a tailored fundraising email and a subject line \
for a newsletter subscriber who opted in to daily or weekly newsletters. You are given the topics \
the reader has clicked on, either as headlines or as slugs taken from the URLs; work out what they \
like to read about.

The email should reference the headlines they click on and call attention to them. The subject line \
should reflect the specific people, places, events or news they care about.

Remind the reader that the newsroom depends on members donating. A member donates to the paper; a \
subscriber receives the newsletter, and not every subscriber is a member. No salutation or \
signature. Connect with the reader's interests and create a sense of urgency: they can make a \
difference, and their donation helps the newsroom create more of the coverage they care about. Do \
not describe their readership as \"clicks\".

More parameters:
- Only 3 paragraphs, no more than 180 words.
- If the interests include significant food coverage, mention Nosh, the award-winning reporting on \
food happenings in the East Bay.
- If the interests focus on Oakland, assume they read The Oaklandside.
- If the interests mention Richmond, the paper they read is Richmondside.
- If the interests mention Berkeley, the paper that covers it is Berkeleyside, now 15 years old.
- Avoid phrases like local stories, community news or local culture.

Both the subject line and the body should reference the reader's most consistent interest, using \
specific people, places or things from the headlines or slug words where possible.";

pub fn fundraising_prompt(headlines: &[String]) -> String {
    format!(
        "Generate a personalized fundraising email based on these topics.  {}",
        headlines.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DraftOutcome {
    NoClickActivity,
    Drafted { headlines: Vec<String>, email: String },
}

pub struct EmailDrafter<'a> {
    store: &'a dyn MembershipStore,
    completion: &'a dyn CompletionClient,
}

impl<'a> EmailDrafter<'a> {
    pub fn new(store: &'a dyn MembershipStore, completion: &'a dyn CompletionClient) -> Self {
        Self { store, completion }
    }

    pub async fn draft_for_subscriber(&self, subscriber_hash: &str) -> Result<DraftOutcome> {
        let headlines = self
            .store
            .recorded_headlines(subscriber_hash)
            .await
            .with_context(|| format!("loading clicks for {subscriber_hash}"))?;
        if headlines.is_empty() {
            info!(subscriber_hash, "no click activity to draft from");
            return Ok(DraftOutcome::NoClickActivity);
        }

        let email = self
            .completion
            .complete(FUNDRAISING_BRIEF, &fundraising_prompt(&headlines))
            .await
            .context("requesting email draft")?;
        info!(subscriber_hash, topics = headlines.len(), "email drafted");
        Ok(DraftOutcome::Drafted { headlines, email })
    }
}
