use anyhow::Result;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

/// How a zero-based page index maps to an engine's page parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pagination {
    /// Result offset: `start + page * per_page`
    Offset { start: u32, per_page: u32 },

    /// 1-based page number
    PageNumber,
}

impl Pagination {
    /// Page parameter for a zero-based page index
    pub fn page_param(&self, page: u32) -> u32 {
        match *self {
            Pagination::Offset { start, per_page } => start.saturating_add(page.saturating_mul(per_page)),
            Pagination::PageNumber => page.saturating_add(1),
        }
    }
}

/// Ordered selector fallback chains, one per extracted field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    pub container: Vec<String>,
    pub title: Vec<String>,
    pub link: Vec<String>,
    pub snippet: Vec<String>,
}

/// Static descriptor of one search engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProfile {
    /// Display name
    pub name: String,

    /// Search URL with `{keyword}` and `{page}` placeholders
    pub url_template: String,

    pub pagination: Pagination,

    pub selectors: SelectorSet,

    /// Origin used to resolve relative result links (redirect links)
    #[serde(default)]
    pub link_origin: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EngineProfile {
    /// Build the request URL for a keyword and zero-based page index
    pub fn build_url(&self, keyword: &str, page: u32) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();

        self.url_template
            .replace("{keyword}", &encoded)
            .replace("{page}", &self.pagination.page_param(page).to_string())
    }

    /// Check the parts of the profile that cannot be caught by parsing alone
    pub fn validate(&self, id: &str) -> Result<()> {
        if !self.url_template.contains("{keyword}") {
            anyhow::bail!("Engine '{}' url_template has no {{keyword}} placeholder", id);
        }

        if let Pagination::Offset { per_page: 0, .. } = self.pagination {
            anyhow::bail!("Engine '{}' pagination per_page must be greater than 0", id);
        }

        if let Some(origin) = &self.link_origin {
            url::Url::parse(origin)
                .map_err(|e| anyhow::anyhow!("Engine '{}' link_origin '{}' is invalid: {}", id, origin, e))?;
        }

        Ok(())
    }
}

fn chain(selectors: &[&str]) -> Vec<String> {
    selectors.iter().map(|s| s.to_string()).collect()
}

/// Built-in engine profiles keyed by engine id
pub fn default_profiles() -> BTreeMap<String, EngineProfile> {
    let mut profiles = BTreeMap::new();

    profiles.insert(
        "baidu".to_string(),
        EngineProfile {
            name: "Baidu".to_string(),
            url_template: "https://www.baidu.com/s?wd={keyword}&pn={page}".to_string(),
            pagination: Pagination::Offset { start: 0, per_page: 10 },
            selectors: SelectorSet {
                container: chain(&[".result", ".c-container"]),
                title: chain(&["h3 a", ".t a"]),
                link: chain(&["h3 a", ".t a"]),
                snippet: chain(&[".c-abstract", ".c-span9"]),
            },
            link_origin: Some("https://www.baidu.com".to_string()),
            enabled: true,
        },
    );

    profiles.insert(
        "bing".to_string(),
        EngineProfile {
            name: "Bing".to_string(),
            url_template: "https://cn.bing.com/search?q={keyword}&first={page}".to_string(),
            pagination: Pagination::Offset { start: 1, per_page: 10 },
            selectors: SelectorSet {
                container: chain(&[".b_algo"]),
                title: chain(&["h2 a"]),
                link: chain(&["h2 a"]),
                snippet: chain(&[".b_caption p"]),
            },
            link_origin: None,
            enabled: true,
        },
    );

    profiles.insert(
        "sogou".to_string(),
        EngineProfile {
            name: "Sogou".to_string(),
            url_template: "https://www.sogou.com/web?query={keyword}&page={page}".to_string(),
            pagination: Pagination::PageNumber,
            selectors: SelectorSet {
                container: chain(&[".results .rb", ".result"]),
                title: chain(&["h3 a", ".pt a"]),
                link: chain(&["h3 a", ".pt a"]),
                snippet: chain(&[".ft", ".str_info"]),
            },
            link_origin: Some("https://www.sogou.com".to_string()),
            enabled: true,
        },
    );

    profiles
}
