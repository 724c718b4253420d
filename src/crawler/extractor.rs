use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::crawler::engine::EngineProfile;
use crate::crawler::task::Fragment;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("invalid {field} selector '{selector}': {message}")]
    InvalidSelector {
        field: &'static str,
        selector: String,
        message: String,
    },

    #[error("invalid link origin '{0}'")]
    InvalidOrigin(String),
}

/// Compiled selectors tried in priority order
struct SelectorChain {
    selectors: Vec<Selector>,
}

impl SelectorChain {
    fn compile(field: &'static str, sources: &[String]) -> Result<Self, ExtractError> {
        let selectors = sources.iter()
            .map(|source| {
                Selector::parse(source).map_err(|e| ExtractError::InvalidSelector {
                    field,
                    selector: source.clone(),
                    message: format!("{:?}", e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { selectors })
    }

    /// First selector's first match with non-empty text
    fn first_text(&self, scope: ElementRef) -> Option<String> {
        self.selectors.iter().find_map(|selector| {
            scope.select(selector)
                .next()
                .map(element_text)
                .filter(|text| !text.is_empty())
        })
    }

    /// First selector's first match with a non-empty href
    fn first_href(&self, scope: ElementRef) -> Option<String> {
        self.selectors.iter().find_map(|selector| {
            scope.select(selector)
                .next()
                .and_then(|el| el.value().attr("href"))
                .map(|href| href.trim().to_string())
                .filter(|href| !href.is_empty())
        })
    }
}

/// Visible text with whitespace runs collapsed
fn element_text(element: ElementRef) -> String {
    element.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Engine-specific structured extraction compiled from a profile
pub struct Extractor {
    container: SelectorChain,
    title: SelectorChain,
    link: SelectorChain,
    snippet: SelectorChain,
    link_origin: Option<Url>,
}

impl Extractor {
    /// Compile the profile's selector chains
    pub fn compile(profile: &EngineProfile) -> Result<Self, ExtractError> {
        let link_origin = match &profile.link_origin {
            Some(origin) => Some(Url::parse(origin).map_err(|_| ExtractError::InvalidOrigin(origin.clone()))?),
            None => None,
        };

        Ok(Self {
            container: SelectorChain::compile("container", &profile.selectors.container)?,
            title: SelectorChain::compile("title", &profile.selectors.title)?,
            link: SelectorChain::compile("link", &profile.selectors.link)?,
            snippet: SelectorChain::compile("snippet", &profile.selectors.snippet)?,
            link_origin,
        })
    }

    /// Extract fragments in document order.
    ///
    /// The first container selector that matches anything wins. No match is
    /// an empty result, not an error. Containers without a title are dropped.
    pub fn extract(&self, markup: &str) -> Vec<Fragment> {
        let document = Html::parse_document(markup);

        let containers: Vec<ElementRef> = self.container.selectors.iter()
            .map(|selector| document.select(selector).collect::<Vec<_>>())
            .find(|matched| !matched.is_empty())
            .unwrap_or_default();

        containers.into_iter()
            .filter_map(|container| self.extract_one(container))
            .collect()
    }

    fn extract_one(&self, container: ElementRef) -> Option<Fragment> {
        let title = self.title.first_text(container)?;

        let url = match self.link.first_href(container) {
            Some(href) => match self.resolve_link(&href) {
                Some(url) => url,
                None => {
                    debug!(href = %href, "Skipping result with unresolvable link");
                    return None;
                }
            },
            None => String::new(),
        };

        let snippet = self.snippet.first_text(container).unwrap_or_default();

        Some(Fragment { title, url, snippet })
    }

    /// Absolute links pass through; relative ones are joined to the origin
    fn resolve_link(&self, href: &str) -> Option<String> {
        match Url::parse(href) {
            Ok(_) => Some(href.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.link_origin {
                Some(origin) => origin.join(href).ok().map(String::from),
                None => Some(href.to_string()),
            },
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::engine::default_profiles;
    use crate::crawler::testing::{mock_profile, results_page};

    #[test]
    fn test_extracts_in_document_order() {
        let extractor = Extractor::compile(&mock_profile("http://localhost")).unwrap();
        let fragments = extractor.extract(&results_page(&["A", "B", "C"]));

        let titles: Vec<&str> = fragments.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, ["A", "B", "C"]);
        assert_eq!(fragments[0].url, "https://site0.example/");
        assert_eq!(fragments[2].snippet, "about C");
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let extractor = Extractor::compile(&mock_profile("http://localhost")).unwrap();
        let page = results_page(&["one", "two"]);
        assert_eq!(extractor.extract(&page), extractor.extract(&page));
    }

    #[test]
    fn test_container_chain_stops_at_first_match() {
        let mut profile = mock_profile("http://localhost");
        profile.selectors.container = vec![
            ".missing".to_string(),
            "#also-missing .x".to_string(),
            ".hit".to_string(),
            "div".to_string(),
        ];
        let extractor = Extractor::compile(&profile).unwrap();

        let fragments = extractor.extract(&results_page(&["first", "second"]));
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].title, "first");
        assert_eq!(fragments[1].title, "second");
    }

    #[test]
    fn test_field_chain_falls_back() {
        let mut profile = mock_profile("http://localhost");
        profile.selectors.title = vec!["h2 a".to_string(), "h3 a".to_string()];
        profile.selectors.snippet = vec![".abstract".to_string(), "p".to_string()];
        let extractor = Extractor::compile(&profile).unwrap();

        let page = r#"<div class="hit"><h2><a href="/x"></a></h2><h3><a href="https://a.example/">Alpha</a></h3>
                      <span class="abstract">  </span><p>fallback   snippet</p></div>"#;
        let fragments = extractor.extract(page);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].title, "Alpha");
        assert_eq!(fragments[0].snippet, "fallback snippet");
    }

    #[test]
    fn test_empty_title_containers_are_dropped() {
        let extractor = Extractor::compile(&mock_profile("http://localhost")).unwrap();
        let page = r#"<div class="hit"><h3><a href="https://ad.example/">   </a></h3></div>
                      <div class="hit"><h3><a href="https://real.example/">Real</a></h3></div>
                      <div class="hit"><p>no heading</p></div>"#;

        let fragments = extractor.extract(page);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].title, "Real");
    }

    #[test]
    fn test_missing_href_yields_empty_url() {
        let extractor = Extractor::compile(&mock_profile("http://localhost")).unwrap();
        let page = r#"<div class="hit"><h3><a>A</a></h3></div><div class="hit"><h3><a href="">B</a></h3></div>"#;

        let fragments = extractor.extract(page);
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.url.is_empty()));
    }

    #[test]
    fn test_no_container_match_is_empty() {
        let extractor = Extractor::compile(&mock_profile("http://localhost")).unwrap();
        assert!(extractor.extract("<html><body>nothing here</body></html>").is_empty());
        assert!(extractor.extract("").is_empty());

        let mut profile = mock_profile("http://localhost");
        profile.selectors.container.clear();
        let extractor = Extractor::compile(&profile).unwrap();
        assert!(extractor.extract(&results_page(&["A"])).is_empty());
    }

    #[test]
    fn test_baidu_redirect_links_become_absolute() {
        let extractor = Extractor::compile(&default_profiles()["baidu"]).unwrap();
        let page = r#"<div class="result c-container">
                        <h3 class="t"><a href="/link?url=abc123">Rust 官网</a></h3>
                        <div class="c-abstract">系统编程语言</div>
                      </div>"#;

        let fragments = extractor.extract(page);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].url, "https://www.baidu.com/link?url=abc123");
        assert_eq!(fragments[0].snippet, "系统编程语言");
    }

    #[test]
    fn test_bing_markup() {
        let extractor = Extractor::compile(&default_profiles()["bing"]).unwrap();
        let page = r#"<ol id="b_results">
                        <li class="b_algo"><h2><a href="https://www.rust-lang.org/">Rust Programming Language</a></h2>
                          <div class="b_caption"><p>A language empowering everyone.</p></div></li>
                        <li class="b_ad"><h2><a href="https://ad.example/">Ad</a></h2></li>
                      </ol>"#;

        let fragments = extractor.extract(page);
        assert_eq!(fragments, vec![Fragment {
            title: "Rust Programming Language".to_string(),
            url: "https://www.rust-lang.org/".to_string(),
            snippet: "A language empowering everyone.".to_string(),
        }]);
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let mut profile = mock_profile("http://localhost");
        profile.selectors.title = vec!["h3 a".to_string(), "a[".to_string()];

        match Extractor::compile(&profile) {
            Err(ExtractError::InvalidSelector { field, selector, .. }) => {
                assert_eq!(field, "title");
                assert_eq!(selector, "a[");
            }
            other => panic!("expected invalid selector, got {:?}", other.err()),
        }
    }
}
