use anyhow::{Result, Context};
use rand::{thread_rng, Rng};
use reqwest::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL,
    CONNECTION, DNT, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::cli::config::FetchSettings;

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Request identity: a User-Agent plus the browser header set that goes with it
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_agent: String,
    pub headers: HeaderMap,
}

/// User-Agent rotation with an optional remote source
pub struct IdentityPool {
    /// Curated static pool
    user_agents: Vec<String>,

    /// Remote list of User-Agents (JSON array of strings)
    source: Option<String>,

    accept_language: HeaderValue,

    /// Remote list, loaded once; empty when the source failed
    dynamic: OnceCell<Vec<String>>,
}

impl IdentityPool {
    /// Create a pool from the fetch settings
    pub fn new(settings: &FetchSettings) -> Self {
        let user_agents = settings.user_agents.iter()
            .filter(|ua| HeaderValue::from_str(ua).is_ok())
            .cloned()
            .collect();

        let accept_language = HeaderValue::from_str(&settings.accept_language)
            .unwrap_or_else(|_| HeaderValue::from_static("en-US,en;q=0.9"));

        Self {
            user_agents,
            source: settings.user_agent_source.clone(),
            accept_language,
            dynamic: OnceCell::new(),
        }
    }

    /// Pick a fresh identity for one attempt
    pub async fn random_identity(&self, client: &Client) -> Identity {
        let user_agent = self.random_user_agent(client).await;
        let headers = self.browser_headers(&user_agent);

        Identity { user_agent, headers }
    }

    async fn random_user_agent(&self, client: &Client) -> String {
        let dynamic: &[String] = match &self.source {
            Some(source) => {
                self.dynamic
                    .get_or_init(|| async {
                        match Self::load_remote(client, source).await {
                            Ok(list) => {
                                debug!("Loaded {} user agents from {}", list.len(), source);
                                list
                            }
                            Err(e) => {
                                warn!("User agent source unavailable, using static pool: {:#}", e);
                                Vec::new()
                            }
                        }
                    })
                    .await
            }
            None => &[],
        };

        let pool = if dynamic.is_empty() { self.user_agents.as_slice() } else { dynamic };

        if pool.is_empty() {
            return FALLBACK_USER_AGENT.to_string();
        }

        pool[thread_rng().gen_range(0..pool.len())].clone()
    }

    async fn load_remote(client: &Client, source: &str) -> Result<Vec<String>> {
        let list: Vec<String> = client.get(source)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("Failed to request user agent list")?
            .error_for_status()
            .context("User agent source returned an error status")?
            .json()
            .await
            .context("Failed to parse user agent list")?;

        Ok(list.into_iter()
            .filter(|ua| !ua.trim().is_empty() && HeaderValue::from_str(ua).is_ok())
            .collect())
    }

    /// Header set of a top-level browser navigation
    fn browser_headers(&self, user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let ua = HeaderValue::from_str(user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_USER_AGENT));
        headers.insert(USER_AGENT, ua);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, self.accept_language.clone());
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        headers.insert(DNT, HeaderValue::from_static("1"));
        headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
        headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("document"));
        headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("navigate"));
        headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("none"));
        headers.insert(HeaderName::from_static("sec-fetch-user"), HeaderValue::from_static("?1"));

        headers
    }
}
