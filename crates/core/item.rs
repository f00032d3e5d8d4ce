//! Work item definition and the crawl request payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::fingerprint::{canonicalize_url, Fingerprint, Fingerprinted};

/// A unit of work in the frontier.
///
/// The fingerprint is derived from the payload when the item is created and
/// never recomputed; the item is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<T> {
    payload: T,
    priority: i64,
    fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "is_false")]
    dont_filter: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl<T: Fingerprinted> WorkItem<T> {
    /// Create a new item, fingerprinting the payload.
    pub fn new(payload: T, priority: i64) -> Result<Self> {
        let fingerprint = payload.fingerprint()?;
        Ok(Self {
            payload,
            priority,
            fingerprint,
            dont_filter: false,
        })
    }

    /// Create an item that bypasses deduplication when enqueued.
    pub fn unfiltered(payload: T, priority: i64) -> Result<Self> {
        let mut item = Self::new(payload, priority)?;
        item.dont_filter = true;
        Ok(item)
    }
}

impl<T> WorkItem<T> {
    /// The payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the item and return the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Priority; its meaning depends on the frontier's [`PriorityOrder`](crate::PriorityOrder).
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Fingerprint of the payload's canonical form.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Whether the item skips the deduper.
    pub fn dont_filter(&self) -> bool {
        self.dont_filter
    }
}

impl<T: Serialize> WorkItem<T> {
    /// Serialize the item to JSON.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: for<'de> Deserialize<'de>> WorkItem<T> {
    /// Deserialize an item from JSON.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A crawl request: the usual frontier payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target URL as discovered.
    pub url: String,
    /// HTTP method, upper-case.
    #[serde(default = "default_method")]
    pub method: String,
    /// Optional request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Link depth from the seed.
    #[serde(default)]
    pub depth: u32,
    /// Free-form metadata carried along; not part of the fingerprint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            body: None,
            depth: 0,
            meta: BTreeMap::new(),
        }
    }

    /// Create a POST request with a body.
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    /// Set the depth.
    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Attach a metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Follow-up request for a link found on this page.
    pub fn follow(&self, url: impl Into<String>) -> Self {
        Self::get(url).depth(self.depth + 1)
    }
}

impl Fingerprinted for Request {
    /// Method, canonical URL and body; depth and metadata are ignored.
    fn fingerprint(&self) -> Result<Fingerprint> {
        let mut canonical = self.method.to_ascii_uppercase();
        canonical.push('\n');
        canonical.push_str(&canonicalize_url(&self.url)?);
        canonical.push('\n');
        if let Some(body) = &self.body {
            canonical.push_str(body);
        }
        Ok(Fingerprint::from_canonical_bytes(canonical.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrontierError;
    use serde_json::json;

    #[test]
    fn test_work_item_derives_fingerprint() {
        let item = WorkItem::new(Request::get("https://example.com/a"), 3).unwrap();
        assert_eq!(item.priority(), 3);
        assert!(!item.dont_filter());
        assert_eq!(
            item.fingerprint(),
            Request::get("https://example.com/a").fingerprint().unwrap()
        );
    }

    #[test]
    fn test_equivalent_urls_collide() {
        let a = Request::get("https://Example.com/p?b=1&a=2#frag");
        let b = Request::get("https://example.com:443/p?a=2&b=1");
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_method_and_body_are_fingerprinted() {
        let get = Request::get("https://example.com/form");
        let post = Request::post("https://example.com/form", "q=1");
        let post2 = Request::post("https://example.com/form", "q=2");
        assert_ne!(get.fingerprint().unwrap(), post.fingerprint().unwrap());
        assert_ne!(post.fingerprint().unwrap(), post2.fingerprint().unwrap());
    }

    #[test]
    fn test_depth_and_meta_are_not_fingerprinted() {
        let a = Request::get("https://example.com/");
        let b = a.follow("https://example.com/").meta("referer", json!("x"));
        assert_eq!(b.depth, 1);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_invalid_url_rejected_at_creation() {
        let err = WorkItem::new(Request::get("::nope::"), 0).unwrap_err();
        assert!(matches!(err, FrontierError::InvalidItem(_)));
    }

    #[test]
    fn test_unfiltered_sets_flag() {
        let item = WorkItem::unfiltered(Request::get("https://example.com/"), 0).unwrap();
        assert!(item.dont_filter());
    }

    #[test]
    fn test_json_roundtrip_keeps_fingerprint() {
        let item = WorkItem::new(Request::post("https://example.com/", "x"), -4).unwrap();
        let json = item.to_json().unwrap();
        assert!(!json.contains("dont_filter"));
        let back: WorkItem<Request> = WorkItem::from_json(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_request_defaults_when_deserializing() {
        let req: Request = serde_json::from_str(r#"{"url":"https://example.com/"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.depth, 0);
        assert!(req.body.is_none());
    }
}
