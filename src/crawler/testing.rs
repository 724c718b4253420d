//! Shared fixtures for unit tests.

use crate::cli::config::{CrawlerSettings, DelayRange, FetchSettings};
use crate::crawler::engine::{EngineProfile, Pagination, SelectorSet};

/// Fetch settings with every delay zeroed
pub fn fast_fetch_settings() -> FetchSettings {
    FetchSettings {
        request_jitter: DelayRange::default(),
        retry_jitter: DelayRange::default(),
        backoff_base_ms: 0,
        backoff_jitter: DelayRange::default(),
        block_cooldown: DelayRange::default(),
        requests_per_host_per_minute: 60_000,
        ..FetchSettings::default()
    }
}

/// Orchestration settings with every delay zeroed
pub fn fast_crawler_settings() -> CrawlerSettings {
    CrawlerSettings {
        page_delay: DelayRange::default(),
        engine_delay: DelayRange::default(),
        ..CrawlerSettings::default()
    }
}

/// Engine profile pointed at a mock server, paging by 1-based page number
pub fn mock_profile(base_uri: &str) -> EngineProfile {
    EngineProfile {
        name: "Mock".to_string(),
        url_template: format!("{}/search?q={{keyword}}&page={{page}}", base_uri),
        pagination: Pagination::PageNumber,
        selectors: SelectorSet {
            container: vec![".hit".to_string()],
            title: vec!["h3 a".to_string()],
            link: vec!["h3 a".to_string()],
            snippet: vec!["p".to_string()],
        },
        link_origin: Some("https://mock.example".to_string()),
        enabled: true,
    }
}

/// Result page with one `.hit` per title
pub fn results_page(titles: &[&str]) -> String {
    let hits: String = titles.iter()
        .enumerate()
        .map(|(i, title)| {
            format!(
                "<div class=\"hit\"><h3><a href=\"https://site{}.example/\">{}</a></h3><p>about {}</p></div>",
                i, title, title
            )
        })
        .collect();

    format!("<html><body><div id=\"results\">{}</div></body></html>", hits)
}
