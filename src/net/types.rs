use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use url::Url;

/// A resource request: the URL plus its HTTP method.
///
/// This is also the cache key. Only GET requests are ever written to or
/// matched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a request from raw method and URL strings.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method '{}': {}", method, e))?;
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// URL used for cache identity. Fragments never reach the network, so they
  /// don't distinguish entries.
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: status_text.into(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Placeholder served when a local resource can't be reached.
  pub fn offline(body: &str) -> Self {
    let mut response = Self::new(503, "Service Unavailable", body);
    response.headers.push((
      "content-type".to_string(),
      "text/plain; charset=utf-8".to_string(),
    ));
    response
  }

  /// True for any 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  #[cfg(test)]
  pub fn text(&self) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}
