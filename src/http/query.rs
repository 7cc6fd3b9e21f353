//! Query-string and `application/x-www-form-urlencoded` handling.
//!
//! Encoding escapes every byte that is not ASCII alphanumeric as `%XX`
//! (uppercase hex) and turns spaces into `+`. Decoding accepts both `%XX`
//! and `+`-for-space; a `%` not followed by two hex digits is kept literally.

use std::fmt::Write as _;

/// An insertion-ordered multimap of decoded query or form parameters.
///
/// # Examples
///
/// ```
/// use weblink::http::Params;
///
/// let params = Params::parse("tag=a&tag=b&name=Alice+Smith");
/// assert_eq!(params.get("name"), Some("Alice Smith"));
/// assert_eq!(params.get_nth("tag", 1), Some("b"));
/// assert_eq!(params.count("tag"), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    inner: Vec<(String, String)>,
}

impl Params {
    /// Creates an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a query string (without the leading `?`).
    pub fn parse(query: &str) -> Self {
        let mut params = Self::new();
        params.extend_from_query(query);
        params
    }

    /// Decodes `query` and appends its pairs after the existing ones.
    ///
    /// Pairs with an empty key are skipped; a key without `=` gets an empty value.
    pub fn extend_from_query(&mut self, query: &str) {
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key);
            if key.is_empty() {
                continue;
            }
            self.inner.push((key, decode_component(value)));
        }
    }

    /// Appends a pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.push((key.into(), value.into()));
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_nth(key, 0)
    }

    /// The `n`-th value (zero-based) recorded for `key`.
    pub fn get_nth(&self, key: &str, n: usize) -> Option<&str> {
        self.inner
            .iter()
            .filter(|(k, _)| k == key)
            .nth(n)
            .map(|(_, v)| v.as_str())
    }

    /// Number of values recorded for `key`.
    pub fn count(&self, key: &str) -> usize {
        self.inner.iter().filter(|(k, _)| k == key).count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes the pairs as `k=v&k2=v2`, percent-encoding keys and values.
    pub fn to_query_string(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.inner.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(&encode_component(k));
            out.push('=');
            out.push_str(&encode_component(v));
        }
        out
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Percent-encodes one key or value.
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b' ' => out.push('+'),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => {
                // Writing to a String cannot fail.
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

/// Decodes one key or value. Invalid UTF-8 in the result is replaced lossily.
pub fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn hex_value(b: Option<&u8>) -> Option<u8> {
    match *b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
