//! Stable fingerprints for work items.
//!
//! A fingerprint is the SHA-256 of a canonical form of the payload, so two
//! payloads that differ only in field order or in equivalent URL spellings
//! collide.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::error::{FrontierError, Result};

/// Fixed-width (32 byte) fingerprint of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash raw canonical bytes.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Fingerprint any serializable value through its canonical JSON form.
    pub fn of_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let canonical = canonical_json(value)?;
        Ok(Self::from_canonical_bytes(canonical.as_bytes()))
    }

    /// Parse a 64 character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| FrontierError::InvalidItem(format!("bad fingerprint {s:?}: {e}")))?;
        Ok(Self(out))
    }

    /// Lower-case hex rendering, as stored in the seen set.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Payloads that know how to fingerprint themselves.
///
/// Implement this for custom payload types; most can delegate to
/// [`Fingerprint::of_canonical_json`].
pub trait Fingerprinted {
    /// Compute the fingerprint of the canonical form of `self`.
    fn fingerprint(&self) -> Result<Fingerprint>;
}

impl Fingerprinted for serde_json::Value {
    fn fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::of_canonical_json(self)
    }
}

impl Fingerprinted for String {
    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::from_canonical_bytes(self.as_bytes()))
    }
}

/// Render a value as JSON with object keys sorted at every depth.
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature is
/// enabled somewhere in the build, so keys are re-sorted explicitly.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<()> {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(val, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Canonicalize a URL for fingerprinting.
///
/// Scheme and host are lower-cased and the default port dropped by the URL
/// parser; on top of that the fragment is removed and query pairs are sorted
/// by key, then value.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| FrontierError::InvalidItem(format!("invalid url {raw:?}: {e}")))?;

    url.set_fragment(None);

    if url.query().is_some() {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_fixed_width_hex() {
        let fp = Fingerprint::from_canonical_bytes(b"hello");
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(
            fp.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let fp = Fingerprint::from_canonical_bytes(b"frontier");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()).unwrap(), fp);
        assert!(Fingerprint::from_hex("zz").is_err());
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        assert_eq!(
            canonical_json(&a).unwrap(),
            r#"{"a":{"x":null,"y":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn test_field_order_does_not_change_fingerprint() {
        let a: serde_json::Value = serde_json::from_str(r#"{"url":"u","depth":1}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"depth":1,"url":"u"}"#).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_canonicalize_url_sorts_query_and_drops_fragment() {
        let url = canonicalize_url("HTTP://Example.COM:80/a?b=2&a=1#top").unwrap();
        assert_eq!(url, "http://example.com/a?a=1&b=2");
    }

    #[test]
    fn test_canonicalize_url_adds_root_path() {
        assert_eq!(
            canonicalize_url("https://example.com").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_canonicalize_url_keeps_duplicate_keys() {
        let url = canonicalize_url("http://example.com/?k=2&k=1").unwrap();
        assert_eq!(url, "http://example.com/?k=1&k=2");
    }

    #[test]
    fn test_canonicalize_url_rejects_garbage() {
        let err = canonicalize_url("not a url").unwrap_err();
        assert!(matches!(err, FrontierError::InvalidItem(_)));
    }

    #[test]
    fn test_fingerprint_serde_as_hex_string() {
        let fp = Fingerprint::from_canonical_bytes(b"x");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
