/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// Create a GET request for the given URL.
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn with_method(mut self, method: impl Into<String>) -> Self {
    self.method = method.into().to_uppercase();
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Header value by case-insensitive name.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// A response snapshot.
///
/// The body is fully buffered, so `clone()` produces a copy that shares
/// nothing with the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let req = Request::get("http://localhost/").with_header("Accept", "text/html");
    assert_eq!(req.header("accept"), Some("text/html"));
    assert_eq!(req.header("x-missing"), None);
  }

  #[test]
  fn test_with_method_uppercases() {
    let req = Request::get("http://localhost/").with_method("post");
    assert_eq!(req.method, "POST");
    assert!(!req.is_get());
  }

  #[test]
  fn test_cloned_response_is_independent() {
    let original = Response::new(200, b"live".to_vec()).with_header("Content-Type", "text/plain");
    let mut copy = original.clone();
    copy.body.clear();
    copy.headers.push(("X-Extra".to_string(), "1".to_string()));

    assert_eq!(original.body, b"live");
    assert_eq!(original.headers.len(), 1);
  }

  #[test]
  fn test_is_ok() {
    assert!(Response::new(204, Vec::new()).is_ok());
    assert!(!Response::new(404, Vec::new()).is_ok());
  }
}
