use std::fmt;
use std::slice;

/// An insertion-ordered multimap of header names to values.
///
/// Lookup is case-insensitive on the name. The serialized wire order equals
/// the insertion order; [`set`](HeaderMap::set) replaces in place so a
/// header keeps its position when overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value for `name` with a single entry. The entry keeps
    /// the position of the first existing occurrence; a new name appends.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut kept = false;
        self.entries.retain_mut(|(n, v)| {
            if !n.eq_ignore_ascii_case(&name) {
                return true;
            }
            if kept {
                return false;
            }
            kept = true;
            *n = name.clone();
            *v = value.clone();
            true
        });
        if !kept {
            self.entries.push((name, value));
        }
    }

    /// Appends a value without touching existing entries for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Removes all values for `name`. Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `(name, value)` pairs in wire order.
    pub fn iter(&self) -> slice::Iter<'_, (String, String)> {
        self.entries.iter()
    }

    /// Comma-aware split of every value for `name` into lowercase tokens.
    /// Used for membership tests on list-valued headers such as
    /// `Accept-Encoding` or `Connection`.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// True when some value of `name` lists `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).iter().any(|t| t == token)
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = &'a (String, String);
    type IntoIter = slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        HeaderMap {
            entries: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut h = HeaderMap::new();
        h.append("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
        assert!(h.contains("cOnTeNt-TyPe"));
    }

    #[test]
    fn append_preserves_duplicates() {
        let mut h = HeaderMap::new();
        h.append("Accept", "text/html");
        h.append("Accept", "application/json");
        let values: Vec<_> = h.get_all("accept").collect();
        assert_eq!(values, ["text/html", "application/json"]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = HeaderMap::new();
        h.append("A", "1");
        h.append("Content-Type", "text/html");
        h.append("B", "2");
        h.append("content-type", "text/plain");
        h.set("CONTENT-TYPE", "application/json");

        let order: Vec<_> = h.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, ["A", "CONTENT-TYPE", "B"]);
        assert_eq!(h.get("content-type"), Some("application/json"));
    }

    #[test]
    fn remove_reports_presence() {
        let mut h = HeaderMap::new();
        assert!(!h.remove("Authorization"));
        h.append("Authorization", "Bearer token");
        assert!(h.remove("authorization"));
        assert!(h.is_empty());
    }

    #[test]
    fn wire_order_is_insertion_order() {
        let mut h = HeaderMap::new();
        h.append("Host", "example.com");
        h.append("User-Agent", "test/1.0");
        h.append("Accept", "*/*");
        assert_eq!(
            h.to_string(),
            "Host: example.com\r\nUser-Agent: test/1.0\r\nAccept: */*\r\n"
        );
    }

    #[test]
    fn token_lists() {
        let mut h = HeaderMap::new();
        h.append("Accept-Encoding", "gzip, deflate , br");
        assert!(h.has_token("accept-encoding", "gzip"));
        assert!(h.has_token("Accept-Encoding", "deflate"));
        assert!(!h.has_token("Accept-Encoding", "zstd"));
    }
}
