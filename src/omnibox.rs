//! Turns whatever follows the proxy prefix into a target URL.

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    Google,
    Brave,
    Duckduckgo,
    Bing,
}

impl SearchEngine {
    fn base(self) -> &'static str {
        match self {
            SearchEngine::Google => "https://www.google.com/search",
            SearchEngine::Brave => "https://search.brave.com/search",
            SearchEngine::Duckduckgo => "https://duckduckgo.com/",
            SearchEngine::Bing => "https://www.bing.com/search",
        }
    }

    pub fn search_url(self, query: &str) -> Result<Url, url::ParseError> {
        Url::parse_with_params(self.base(), &[("q", query)])
    }
}

/// http(s) URLs pass through; `host.tld`-looking input gets `https://`;
/// anything else becomes a search.
pub fn resolve(input: &str, engine: SearchEngine) -> Result<Url, url::ParseError> {
    let input = input.trim();
    if let Ok(url) = Url::parse(input) {
        if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() {
            return Ok(url);
        }
    }
    if input.contains('.') && !input.contains(char::is_whitespace) {
        if let Ok(url) = Url::parse(&format!("https://{input}")) {
            return Ok(url);
        }
    }
    engine.search_url(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_domains_and_queries() {
        let g = SearchEngine::Google;
        assert_eq!(
            resolve("https://example.com/a?b=1", g).unwrap().as_str(),
            "https://example.com/a?b=1"
        );
        assert_eq!(resolve("example.com/path", g).unwrap().as_str(), "https://example.com/path");

        let q = resolve("rust ownership rules", SearchEngine::Duckduckgo).unwrap();
        assert_eq!(q.host_str(), Some("duckduckgo.com"));
        assert_eq!(
            q.query_pairs().find(|(k, _)| k == "q").unwrap().1,
            "rust ownership rules"
        );
    }

    #[test]
    fn engine_names_are_lowercase() {
        let e: SearchEngine = serde_json::from_str("\"brave\"").unwrap();
        assert_eq!(e, SearchEngine::Brave);
        assert_eq!(e.search_url("x").unwrap().as_str(), "https://search.brave.com/search?q=x");
    }
}
