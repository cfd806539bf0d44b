//! Header storage that preserves what the wire needs preserved.
//!
//! `http::HeaderMap` alone does not guarantee the emission order that
//! fingerprint-sensitive peers observe. [`OrderedHeaders`] keeps a
//! first-insertion log next to the map so headers can be written back in
//! the order the caller set them, and [`HeaderOrder`] lets a request pin
//! an explicit ordering for a subset of names, which are then emitted
//! first.

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// An explicit header ordering list.
///
/// Names in the list are written first, in list order; all remaining
/// headers follow in insertion order.
#[derive(Debug, Clone, Default)]
pub struct HeaderOrder(Vec<HeaderName>);

impl HeaderOrder {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: HeaderName) {
        self.0.push(name);
    }

    #[must_use]
    pub fn names(&self) -> &[HeaderName] {
        &self.0
    }
}

impl FromIterator<HeaderName> for HeaderOrder {
    fn from_iter<T: IntoIterator<Item = HeaderName>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A multi-valued header collection that preserves per-name insertion
/// order across the whole collection.
#[derive(Debug, Clone, Default)]
pub struct OrderedHeaders {
    map: HeaderMap,
    /// ordered by first insert of each name
    order: Vec<HeaderName>,
}

impl OrderedHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the header, replacing all previous values for the name.
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        if self.map.insert(&name, value).is_none() {
            self.order.push(name);
        }
    }

    /// Adds a value without touching previous ones.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.map.append(&name, value) {
            self.order.push(name);
        }
    }

    pub fn remove(&mut self, name: &HeaderName) {
        if self.map.remove(name).is_some() {
            self.order.retain(|n| n != name);
        }
    }

    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.map.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &HeaderName) -> bool {
        self.map.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Iterates `(name, value)` pairs: names in first-insertion order,
    /// values per name in append order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.order
            .iter()
            .flat_map(|name| self.map.get_all(name).iter().map(move |v| (name, v)))
    }

    /// Iterates like [`Self::iter`], but names listed in `explicit` come
    /// first, in list order. Listed names absent from the collection are
    /// skipped.
    pub fn iter_with_order<'a>(
        &'a self,
        explicit: Option<&'a HeaderOrder>,
    ) -> impl Iterator<Item = (&'a HeaderName, &'a HeaderValue)> {
        let explicit = explicit.map(HeaderOrder::names).unwrap_or_default();
        let first = explicit
            .iter()
            .filter(|name| self.map.contains_key(*name))
            .flat_map(|name| self.map.get_all(name).iter().map(move |v| (name, v)));
        let rest = self
            .order
            .iter()
            .filter(move |name| !explicit.contains(name))
            .flat_map(|name| self.map.get_all(name).iter().map(move |v| (name, v)));
        first.chain(rest)
    }

    /// View of the underlying map, losing order information.
    #[must_use]
    pub fn as_map(&self) -> &HeaderMap {
        &self.map
    }

    /// Merge defaults into this collection: a defaulted name is only
    /// taken when the collection does not already carry it.
    pub fn merge_defaults(&mut self, defaults: &Self) {
        for name in &defaults.order {
            if !self.map.contains_key(name) {
                for value in defaults.map.get_all(name) {
                    self.append(name.clone(), value.clone());
                }
            }
        }
    }
}

impl From<HeaderMap> for OrderedHeaders {
    fn from(map: HeaderMap) -> Self {
        let order = map.keys().cloned().collect();
        Self { map, order }
    }
}

/// Hop-by-hop names are owned by the framer; user-supplied values for
/// them never make it onto the wire.
pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "proxy-connection" | "keep-alive" | "transfer-encoding" | "upgrade"
    )
}

/// Canonical names that title-casing alone gets wrong.
const TITLE_CASE_EXCEPTIONS: &[(&str, &str)] = &[
    ("etag", "ETag"),
    ("te", "TE"),
    ("dnt", "DNT"),
    ("content-md5", "Content-MD5"),
    ("www-authenticate", "WWW-Authenticate"),
    ("x-real-ip", "X-Real-IP"),
];

/// Writes `name` into `dst` with the first letter and every post-hyphen
/// letter uppercased, keeping the exception set as-is.
pub(crate) fn write_title_case(dst: &mut Vec<u8>, name: &HeaderName) {
    let lower = name.as_str();
    for (needle, canonical) in TITLE_CASE_EXCEPTIONS {
        if lower == *needle {
            dst.extend_from_slice(canonical.as_bytes());
            return;
        }
    }

    let mut at_start = true;
    for &b in lower.as_bytes() {
        if at_start {
            dst.push(b.to_ascii_uppercase());
        } else {
            dst.push(b);
        }
        at_start = b == b'-';
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};

    fn names<'a>(it: impl Iterator<Item = (&'a HeaderName, &'a HeaderValue)>) -> Vec<String> {
        it.map(|(n, _)| n.as_str().to_owned()).collect()
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut headers = OrderedHeaders::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("fletch"));
        headers.append(ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        assert_eq!(
            names(headers.iter()),
            vec!["user-agent", "accept", "accept", "content-type"]
        );
    }

    #[test]
    fn explicit_order_goes_first() {
        let mut headers = OrderedHeaders::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("fletch"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let order: HeaderOrder = [CONTENT_TYPE, ACCEPT].into_iter().collect();
        assert_eq!(
            names(headers.iter_with_order(Some(&order))),
            vec!["content-type", "accept", "user-agent"]
        );
    }

    #[test]
    fn removing_forgets_the_order_slot() {
        let mut headers = OrderedHeaders::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("fletch"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.remove(&USER_AGENT);
        headers.insert(USER_AGENT, HeaderValue::from_static("fletch/2"));

        assert_eq!(names(headers.iter()), vec!["accept", "user-agent"]);
    }

    #[test]
    fn title_case_and_exceptions() {
        let mut buf = Vec::new();
        write_title_case(&mut buf, &HeaderName::from_static("x-request-id"));
        assert_eq!(buf, b"X-Request-Id");

        buf.clear();
        write_title_case(&mut buf, &HeaderName::from_static("etag"));
        assert_eq!(buf, b"ETag");
    }

    #[test]
    fn defaults_do_not_override() {
        let mut headers = OrderedHeaders::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("mine"));

        let mut defaults = OrderedHeaders::new();
        defaults.insert(USER_AGENT, HeaderValue::from_static("default"));
        defaults.insert(ACCEPT, HeaderValue::from_static("*/*"));

        headers.merge_defaults(&defaults);
        assert_eq!(headers.get(&USER_AGENT).map(HeaderValue::as_bytes), Some(&b"mine"[..]));
        assert!(headers.contains(&ACCEPT));
    }
}
