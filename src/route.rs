//! Request classification: which strategy, if any, handles a request.

use url::Url;

use crate::net::Request;

/// How an intercepted request is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not http(s); left to the platform untouched
  PassThrough,
  /// Third-party resource, network-first
  Cdn,
  /// Everything else, cache-first
  Local,
}

/// Classifies requests against the configured CDN resource list.
#[derive(Debug, Clone)]
pub struct Classifier {
  cdn_prefixes: Vec<String>,
}

impl Classifier {
  pub fn new<I, T>(cdn_resources: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
  {
    let cdn_prefixes = cdn_resources
      .into_iter()
      .map(|entry| normalize_prefix(strip_query(entry.as_ref())))
      .filter(|prefix| !prefix.is_empty())
      .collect();

    Self { cdn_prefixes }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if !matches!(request.url.scheme(), "http" | "https") {
      return Route::PassThrough;
    }

    let url = strip_query(request.url.as_str());
    if self
      .cdn_prefixes
      .iter()
      .any(|prefix| url.starts_with(prefix.as_str()))
    {
      Route::Cdn
    } else {
      Route::Local
    }
  }
}

/// Entries are compared against parsed request URLs, so they get the same
/// normalization (lowercase host, default port dropped). Unparseable
/// entries are kept verbatim.
fn normalize_prefix(entry: &str) -> String {
  Url::parse(entry)
    .map(String::from)
    .unwrap_or_else(|_| entry.to_string())
}

fn strip_query(url: &str) -> &str {
  url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new([
      "https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/gsap.min.js",
      "https://fonts.googleapis.com/css2?family=Noto+Sans+SC:wght@400;500;700&display=swap",
    ])
  }

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[test]
  fn test_non_http_passes_through() {
    let c = classifier();
    assert_eq!(
      c.classify(&get("chrome-extension://abcdef/content.js")),
      Route::PassThrough
    );
    assert_eq!(c.classify(&get("data:text/plain,hello")), Route::PassThrough);
  }

  #[test]
  fn test_cdn_exact_match() {
    let c = classifier();
    assert_eq!(
      c.classify(&get(
        "https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/gsap.min.js"
      )),
      Route::Cdn
    );
  }

  #[test]
  fn test_cdn_ignores_query_strings() {
    let c = classifier();
    // Different query than the configured entry
    assert_eq!(
      c.classify(&get(
        "https://fonts.googleapis.com/css2?family=Roboto&display=swap"
      )),
      Route::Cdn
    );
    assert_eq!(
      c.classify(&get(
        "https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/gsap.min.js?v=3"
      )),
      Route::Cdn
    );
  }

  #[test]
  fn test_query_does_not_create_prefix_match() {
    let c = classifier();
    assert_eq!(
      c.classify(&get(
        "https://example.com/proxy?u=https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/gsap.min.js"
      )),
      Route::Local
    );
  }

  #[test]
  fn test_cdn_entries_normalized_like_requests() {
    let c = Classifier::new(["https://CDN.Example.com:443/libs/app.min.js?v=1"]);
    assert_eq!(
      c.classify(&get("https://cdn.example.com/libs/app.min.js")),
      Route::Cdn
    );
    assert_eq!(
      c.classify(&get("https://CDN.EXAMPLE.COM/libs/app.min.js?v=2")),
      Route::Cdn
    );
  }

  #[test]
  fn test_everything_else_is_local() {
    let c = classifier();
    assert_eq!(c.classify(&get("https://app.example.com/index.html")), Route::Local);
    assert_eq!(
      c.classify(&get("https://cdnjs.cloudflare.com/ajax/libs/xlsx/0.18.5/xlsx.full.min.js")),
      Route::Local
    );
    assert_eq!(
      c.classify(&Request::parse("POST", "https://app.example.com/api").unwrap()),
      Route::Local
    );
  }
}
