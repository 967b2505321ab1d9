//! Follow-graph API client: paginated `getFollows` lookups used
//! by the main stream's follow-sync bootstrap and by temp-stream start
//! requests that need a user's current follow list.

use std::time::Duration;

use jetwatch_core::types::{Did, Handle};
use serde::Deserialize;
use tracing::warn;

const FOLLOWS_PAGE_LIMIT: u32 = 100;
const MAX_PAGES: usize = 100; // ~10_000 follows per user

#[derive(Debug, Deserialize)]
struct GetFollowsResponse {
    follows: Vec<FollowEntry>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowEntry {
    did: String,
    #[serde(default)]
    handle: Option<String>,
}

pub struct FollowGraphClient {
    http: reqwest::Client,
    host: String,
}

impl FollowGraphClient {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder config is static and valid");
        Self { http, host: host.into() }
    }

    /// Fetches every follow for `did`, paginating up to `MAX_PAGES` pages.
    /// A request failure logs and returns what's been accumulated so far
    /// rather than propagating.
    pub async fn get_follows(&self, did: &Did) -> Vec<(Did, Handle)> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut url = format!(
                "https://{}/xrpc/app.bsky.graph.getFollows?actor={did}&limit={FOLLOWS_PAGE_LIMIT}",
                self.host
            );
            if let Some(c) = &cursor {
                url.push_str(&format!("&cursor={c}"));
            }

            let page = match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<GetFollowsResponse>().await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(%did, %err, "malformed getFollows response, stopping pagination");
                        break;
                    }
                },
                Ok(resp) => {
                    warn!(%did, status = %resp.status(), "getFollows request failed");
                    break;
                }
                Err(err) => {
                    warn!(%did, %err, "getFollows request errored");
                    break;
                }
            };

            let page_len = page.follows.len();
            out.extend(
                page.follows
                    .into_iter()
                    .map(|f| (Did::new(f.did), Handle::from(f.handle))),
            );

            match page.cursor {
                Some(next) if page_len == FOLLOWS_PAGE_LIMIT as usize => cursor = Some(next),
                _ => break,
            }
        }

        out
    }
}
