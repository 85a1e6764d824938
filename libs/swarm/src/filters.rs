use std::collections::BTreeMap;

/// Engine API list filters, serialized as the `filters` query parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters(BTreeMap<String, Vec<String>>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.entry(key.to_string()).or_default().push(value.into());
        self
    }

    /// Name filter. The engine matches services by prefix and networks by substring.
    pub fn name(self, name: impl Into<String>) -> Self {
        self.push("name", name)
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.push("id", id)
    }

    /// `key=value` label filter.
    pub fn label(self, key: &str, value: &str) -> Self {
        self.push("label", format!("{key}={value}"))
    }

    /// Label presence filter.
    pub fn label_key(self, key: &str) -> Self {
        self.push("label", key)
    }

    /// Tasks of a service (by id or name).
    pub fn service(self, service: impl Into<String>) -> Self {
        self.push("service", service)
    }

    pub fn scope(self, scope: &str) -> Self {
        self.push("scope", scope)
    }

    pub fn desired_state(self, state: &str) -> Self {
        self.push("desired-state", state)
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Percent-encoded `filters=...` query string, or an empty string.
    pub fn to_query(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        // a BTreeMap<String, Vec<String>> always serializes
        let json = serde_json::to_string(&self.0).unwrap_or_default();
        format!("filters={}", percent_encode(&json))
    }

    /// Label filters as `(key, Some(value))` or `(key, None)` pairs.
    pub fn label_pairs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.get("label").iter().map(|raw| match raw.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (raw.as_str(), None),
        })
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filters_produce_no_query() {
        assert_eq!(Filters::new().to_query(), "");
    }

    #[test]
    fn test_query_is_encoded_json() {
        let filters = Filters::new().label("uuid", "abc").name("dy-sidecar_");
        assert_eq!(
            filters.to_query(),
            "filters=%7B%22label%22%3A%5B%22uuid%3Dabc%22%5D%2C%22name%22%3A%5B%22dy-sidecar_%22%5D%7D"
        );
    }

    #[test]
    fn test_label_pairs() {
        let filters = Filters::new().label("a", "1").label_key("b");
        let pairs: Vec<_> = filters.label_pairs().collect();
        assert_eq!(pairs, vec![("a", Some("1")), ("b", None)]);
    }
}
