//! A conservative in-memory cookie store (RFC 6265 subset).
//!
//! Supports `Domain`, `Path` and `Max-Age`; other attributes are ignored
//! and `Expires` dates are treated as session cookies. Used by the client
//! to forward cookies across a redirect chain; nothing is persisted.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    expires: Option<Instant>,
}

impl Cookie {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        let domain_ok = host.eq_ignore_ascii_case(&self.domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", self.domain.to_ascii_lowercase()));
        let path_ok = path.starts_with(&self.path);
        domain_ok && path_ok
    }
}

/// Ordered set of cookies, keyed by `(name, domain, path)`.
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    cookies: Vec<Cookie>,
}

impl CookieStore {
    pub fn new() -> CookieStore {
        CookieStore::default()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Stores one `Set-Cookie` header value received from `host`.
    /// A `Max-Age` of zero (or less) deletes the cookie.
    pub fn store(&mut self, host: &str, set_cookie: &str) {
        let mut parts = set_cookie.split(';');
        let Some(pair) = parts.next() else { return };
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.is_empty() {
            return;
        }

        let mut domain = host.to_string();
        let mut path = "/".to_string();
        let mut expires = None;
        let mut delete = false;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                domain = val.trim_start_matches('.').to_string();
            } else if key.eq_ignore_ascii_case("path") && !val.is_empty() {
                path = val.to_string();
            } else if key.eq_ignore_ascii_case("max-age") {
                match val.parse::<i64>() {
                    Ok(secs) if secs > 0 => {
                        expires = Some(Instant::now() + Duration::from_secs(secs as u64));
                    }
                    Ok(_) => delete = true,
                    Err(_) => {}
                }
            }
        }

        self.cookies
            .retain(|c| !(c.name == name && c.domain == domain && c.path == path));
        if !delete {
            self.cookies.push(Cookie {
                name,
                value,
                domain,
                path,
                expires,
            });
        }
    }

    /// The `Cookie` header value for a request to `host` + `path`, if any
    /// stored cookie matches. Expired entries are pruned on the way.
    pub fn header_for(&mut self, host: &str, path: &str) -> Option<String> {
        let now = Instant::now();
        self.cookies.retain(|c| !c.is_expired(now));
        let header = self
            .cookies
            .iter()
            .filter(|c| c.matches(host, path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_matches() {
        let mut store = CookieStore::new();
        store.store("example.com", "session=abc123");
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.header_for("example.com", "/").as_deref(),
            Some("session=abc123")
        );
        assert_eq!(store.header_for("other.com", "/"), None);
    }

    #[test]
    fn domain_suffix_matching() {
        let mut store = CookieStore::new();
        store.store("example.com", "id=1; Domain=example.com");
        assert!(store.header_for("api.example.com", "/").is_some());
        assert!(store.header_for("example.com", "/").is_some());
        assert!(store.header_for("badexample.com", "/").is_none());
    }

    #[test]
    fn path_prefix_matching() {
        let mut store = CookieStore::new();
        store.store("example.com", "admin=1; Path=/admin");
        assert!(store.header_for("example.com", "/admin/users").is_some());
        assert!(store.header_for("example.com", "/public").is_none());
    }

    #[test]
    fn replaces_same_cookie() {
        let mut store = CookieStore::new();
        store.store("example.com", "session=old");
        store.store("example.com", "session=new");
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.header_for("example.com", "/").as_deref(),
            Some("session=new")
        );
    }

    #[test]
    fn max_age_zero_deletes() {
        let mut store = CookieStore::new();
        store.store("example.com", "session=abc");
        store.store("example.com", "session=abc; Max-Age=0");
        assert!(store.header_for("example.com", "/").is_none());
    }

    #[test]
    fn multiple_cookies_joined() {
        let mut store = CookieStore::new();
        store.store("example.com", "a=1");
        store.store("example.com", "b=2");
        assert_eq!(
            store.header_for("example.com", "/").as_deref(),
            Some("a=1; b=2")
        );
    }

    #[test]
    fn malformed_values_ignored() {
        let mut store = CookieStore::new();
        store.store("example.com", "no_equals_sign");
        store.store("example.com", "=value_without_name");
        assert!(store.is_empty());
    }
}
