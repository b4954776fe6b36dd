//! Route compilation and dispatch.
//!
//! Patterns are tokenized on `/`; a segment is a literal, a `:name`
//! capture, or a `:name(regex)` constrained capture. The regex `.+` makes
//! the capture greedy, absorbing the remaining path, and is only legal in
//! the last segment. Exact-literal routes match through a hash lookup;
//! parameterized routes are tried in registration order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;

use super::handler::ArcHandler;
use crate::http::{url, Method, Request as HttpRequest, Response};

/// Authentication requirement attached to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthLevel {
    #[default]
    None,
    /// Any principal authenticated by a basic-auth guard.
    Basic,
    /// A principal listed as an administrator.
    Admin,
}

/// Credential source for a basic-auth guard.
#[derive(Clone)]
pub enum Credentials {
    Single { user: String, password: String },
    Map(HashMap<String, String>),
    Verify(Arc<dyn Fn(&str, &str) -> bool + Send + Sync>),
}

impl Credentials {
    pub fn single(user: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials::Single {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn map(users: HashMap<String, String>) -> Credentials {
        Credentials::Map(users)
    }

    pub fn verify(f: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Credentials {
        Credentials::Verify(Arc::new(f))
    }

    fn check(&self, user: &str, password: &str) -> bool {
        match self {
            Credentials::Single {
                user: expected,
                password: secret,
            } => user == expected && password == secret,
            Credentials::Map(users) => users.get(user).is_some_and(|p| p == password),
            Credentials::Verify(f) => f(user, password),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Single { user, .. } => {
                f.debug_struct("Single").field("user", user).finish()
            }
            Credentials::Map(users) => f.debug_struct("Map").field("users", &users.len()).finish(),
            Credentials::Verify(_) => f.write_str("Verify(..)"),
        }
    }
}

impl From<(&str, &str)> for Credentials {
    fn from((user, password): (&str, &str)) -> Self {
        Credentials::single(user, password)
    }
}

impl From<HashMap<String, String>> for Credentials {
    fn from(users: HashMap<String, String>) -> Self {
        Credentials::Map(users)
    }
}

#[derive(Debug, Clone)]
struct AuthGuard {
    prefix: String,
    realm: String,
    credentials: Credentials,
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Capture { name: String, regex: Option<Regex> },
    Wildcard { name: String },
}

/// A registered route. Returned by the registration methods so callers can
/// chain configuration, e.g. `server.put("/up/:f", h).deferred()`.
pub struct Route {
    pub(crate) method: Method,
    pub(crate) pattern: String,
    segments: Vec<Segment>,
    pub(crate) handler: ArcHandler,
    pub(crate) deferred: bool,
    pub(crate) auth: AuthLevel,
}

impl Route {
    /// Runs the handler before the body is read; the handler pulls the
    /// body incrementally through [`Request::read`](super::Request::read).
    pub fn deferred(&mut self) -> &mut Route {
        self.deferred = true;
        self
    }

    /// Requires authentication at the given level.
    pub fn auth(&mut self, level: AuthLevel) -> &mut Route {
        self.auth = level;
        self
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("deferred", &self.deferred)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct MethodRoutes {
    exact: HashMap<String, usize>,
    patterns: Vec<usize>,
}

/// Result of a successful dispatch: the route plus URL-decoded captures.
pub(crate) struct RouteMatch<'r> {
    pub route: &'r Route,
    pub captures: Vec<(String, String)>,
}

pub(crate) enum AuthOutcome {
    /// Authenticated principal, if any guard applied.
    Allowed(Option<String>),
    /// 401 with this realm.
    Denied(String),
}

/// Compiled routing table plus the built-in CORS and basic-auth guards.
/// Read-only once the server starts.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    methods: HashMap<Method, MethodRoutes>,
    fallback: Option<ArcHandler>,
    cors: bool,
    guards: Vec<AuthGuard>,
    admin_users: Vec<String>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            admin_users: vec!["admin".to_string()],
            ..Default::default()
        }
    }

    /// Registers a route, compiling its pattern. Panics on a malformed
    /// pattern; registration runs at startup, before any traffic.
    pub(crate) fn add(&mut self, method: Method, pattern: &str, handler: ArcHandler) -> usize {
        assert!(
            pattern.starts_with('/'),
            "route pattern must start with '/': {pattern:?}"
        );
        let segments = compile_pattern(pattern);
        let is_exact = segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)));

        let idx = self.routes.len();
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            segments,
            handler,
            deferred: false,
            auth: AuthLevel::None,
        });

        let entry = self.methods.entry(method).or_default();
        if is_exact {
            entry.exact.insert(pattern.to_string(), idx);
        } else {
            entry.patterns.push(idx);
        }
        idx
    }

    pub(crate) fn route_mut(&mut self, idx: usize) -> &mut Route {
        &mut self.routes[idx]
    }

    pub(crate) fn set_fallback(&mut self, handler: ArcHandler) {
        self.fallback = Some(handler);
    }

    pub(crate) fn fallback(&self) -> Option<&ArcHandler> {
        self.fallback.as_ref()
    }

    pub(crate) fn set_cors(&mut self, enabled: bool) {
        self.cors = enabled;
    }

    pub(crate) fn cors_enabled(&self) -> bool {
        self.cors
    }

    pub(crate) fn add_basic_auth(
        &mut self,
        prefix: impl Into<String>,
        realm: impl Into<String>,
        credentials: Credentials,
    ) {
        self.guards.push(AuthGuard {
            prefix: prefix.into(),
            realm: realm.into(),
            credentials,
        });
    }

    pub(crate) fn set_admin_users(&mut self, users: Vec<String>) {
        self.admin_users = users;
    }

    /// Dispatches `method` + `path`: exact bucket first, then the
    /// parameterized routes in insertion order. `None` on a route miss or
    /// an unnormalizable path.
    pub(crate) fn find(&self, method: Method, path: &str) -> Option<RouteMatch<'_>> {
        let segments = normalize_path(path)?;
        let table = self.methods.get(&method)?;

        let joined = join_path(&segments);
        if let Some(&idx) = table.exact.get(joined.as_str()) {
            return Some(RouteMatch {
                route: &self.routes[idx],
                captures: Vec::new(),
            });
        }
        for &idx in &table.patterns {
            let route = &self.routes[idx];
            if let Some(captures) = match_segments(&route.segments, &segments) {
                return Some(RouteMatch { route, captures });
            }
        }
        None
    }

    /// Applies the basic-auth guards and the route-level requirement.
    pub(crate) fn authenticate(&self, req: &HttpRequest, level: AuthLevel) -> AuthOutcome {
        let path = req.path();
        let guard = self
            .guards
            .iter()
            .filter(|g| path.starts_with(g.prefix.as_str()))
            .max_by_key(|g| g.prefix.len());

        let principal = match guard {
            Some(guard) => match verify_basic(req, &guard.credentials) {
                Some(user) => Some(user),
                None => return AuthOutcome::Denied(guard.realm.clone()),
            },
            None => None,
        };

        match level {
            AuthLevel::None => AuthOutcome::Allowed(principal),
            AuthLevel::Basic => match principal {
                Some(user) => AuthOutcome::Allowed(Some(user)),
                None => AuthOutcome::Denied("Restricted".to_string()),
            },
            AuthLevel::Admin => match principal {
                Some(user) if self.admin_users.iter().any(|a| a == &user) => {
                    AuthOutcome::Allowed(Some(user))
                }
                _ => AuthOutcome::Denied("Restricted".to_string()),
            },
        }
    }

    /// Injects the CORS response headers.
    pub(crate) fn apply_cors(&self, res: &mut Response) {
        if !self.cors {
            return;
        }
        let headers = res.headers_mut();
        headers.set("Access-Control-Allow-Origin", "*");
        headers.set(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, PATCH, DELETE, OPTIONS",
        );
        headers.set(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization",
        );
        headers.set("Access-Control-Max-Age", "86400");
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .field("cors", &self.cors)
            .field("guards", &self.guards.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

fn verify_basic(req: &HttpRequest, credentials: &Credentials) -> Option<String> {
    let value = req.header("Authorization")?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    credentials
        .check(user, password)
        .then(|| user.to_string())
}

fn compile_pattern(pattern: &str) -> Vec<Segment> {
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, part) in raw.iter().enumerate() {
        let segment = match part.strip_prefix(':') {
            None => Segment::Literal((*part).to_string()),
            Some(capture) => match capture.split_once('(') {
                None => Segment::Capture {
                    name: capture.to_string(),
                    regex: None,
                },
                Some((name, tail)) => {
                    let constraint = tail.strip_suffix(')').unwrap_or_else(|| {
                        panic!("unterminated constraint in route pattern {pattern:?}")
                    });
                    if constraint == ".+" {
                        assert!(
                            i == raw.len() - 1,
                            "greedy wildcard must be the last segment: {pattern:?}"
                        );
                        Segment::Wildcard {
                            name: name.to_string(),
                        }
                    } else {
                        let regex = Regex::new(&format!("^(?:{constraint})$")).unwrap_or_else(|e| {
                            panic!("invalid constraint in route pattern {pattern:?}: {e}")
                        });
                        Segment::Capture {
                            name: name.to_string(),
                            regex: Some(regex),
                        }
                    }
                }
            },
        };
        segments.push(segment);
    }
    segments
}

/// Collapses duplicate slashes and rejects `.`/`..` segments.
fn normalize_path(path: &str) -> Option<Vec<&str>> {
    let mut out = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => {}
            "." | ".." => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

fn join_path(segments: &[&str]) -> String {
    let mut out = String::with_capacity(segments.iter().map(|s| s.len() + 1).sum::<usize>() + 1);
    out.push('/');
    for (i, s) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(s);
    }
    out
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> Option<Vec<(String, String)>> {
    let mut captures = Vec::new();
    for (i, segment) in pattern.iter().enumerate() {
        match segment {
            Segment::Wildcard { name } => {
                // absorbs the rest of the path, slashes included
                if i >= path.len() {
                    return None;
                }
                let rest = path[i..].join("/");
                captures.push((name.clone(), url::decode(&rest).unwrap_or(rest)));
                return Some(captures);
            }
            _ if i >= path.len() => return None,
            Segment::Literal(lit) => {
                if lit != path[i] {
                    return None;
                }
            }
            Segment::Capture { name, regex } => {
                if let Some(regex) = regex {
                    if !regex.is_match(path[i]) {
                        return None;
                    }
                }
                let raw = path[i];
                captures.push((name.clone(), url::decode(raw).unwrap_or_else(|| raw.to_string())));
            }
        }
    }
    if pattern.len() == path.len() {
        Some(captures)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::handler::noop_handler;
    use super::*;

    fn router_with(routes: &[(Method, &str)]) -> Router {
        let mut router = Router::new();
        for (method, pattern) in routes {
            router.add(*method, pattern, noop_handler());
        }
        router
    }

    #[test]
    fn exact_before_parameterized() {
        let router = router_with(&[
            (Method::Get, "/api/v1/users/:user"),
            (Method::Get, "/api/v1/users/me"),
        ]);
        let m = router.find(Method::Get, "/api/v1/users/me").unwrap();
        assert_eq!(m.route.pattern, "/api/v1/users/me");
        assert!(m.captures.is_empty());

        let m = router.find(Method::Get, "/api/v1/users/john").unwrap();
        assert_eq!(m.route.pattern, "/api/v1/users/:user");
        assert_eq!(m.captures, vec![("user".to_string(), "john".to_string())]);
    }

    #[test]
    fn constrained_captures() {
        let router = router_with(&[(Method::Get, "/api/v1/users/:user([a-zA-Z0-9_-]{1,32})")]);
        let m = router.find(Method::Get, "/api/v1/users/john_doe").unwrap();
        assert_eq!(m.captures[0].1, "john_doe");

        assert!(router.find(Method::Get, "/api/v1/users/john!").is_none());
        assert!(router
            .find(Method::Get, &format!("/api/v1/users/{}", "x".repeat(33)))
            .is_none());
    }

    #[test]
    fn numeric_constraint() {
        let router = router_with(&[(Method::Get, "/api/v1/items/:id([0-9]+)")]);
        assert!(router.find(Method::Get, "/api/v1/items/123").is_some());
        assert!(router.find(Method::Get, "/api/v1/items/abc").is_none());
    }

    #[test]
    fn greedy_wildcard_absorbs_slashes() {
        let router = router_with(&[(Method::Get, "/api/v1/files/:path(.+)")]);
        let m = router
            .find(Method::Get, "/api/v1/files/docs/readme.txt")
            .unwrap();
        assert_eq!(m.captures[0], ("path".to_string(), "docs/readme.txt".to_string()));

        assert!(router.find(Method::Get, "/api/v1/files/").is_none());
    }

    #[test]
    #[should_panic(expected = "greedy wildcard must be the last segment")]
    fn wildcard_must_be_last() {
        router_with(&[(Method::Get, "/files/:path(.+)/meta")]);
    }

    #[test]
    fn methods_are_disjoint() {
        let router = router_with(&[(Method::Get, "/thing"), (Method::Post, "/thing")]);
        let get = router.find(Method::Get, "/thing").unwrap();
        assert_eq!(get.route.method, Method::Get);
        assert!(router.find(Method::Delete, "/thing").is_none());
    }

    #[test]
    fn path_normalization() {
        let router = router_with(&[(Method::Get, "/a/b")]);
        assert!(router.find(Method::Get, "/a//b").is_some());
        assert!(router.find(Method::Get, "/a/./b").is_none());
        assert!(router.find(Method::Get, "/a/../b").is_none());
    }

    #[test]
    fn captures_are_url_decoded() {
        let router = router_with(&[(Method::Get, "/search/:term")]);
        let m = router.find(Method::Get, "/search/hello%20world").unwrap();
        assert_eq!(m.captures[0].1, "hello world");
    }

    #[test]
    fn dispatch_is_deterministic() {
        let router = router_with(&[
            (Method::Get, "/x/:a"),
            (Method::Get, "/x/:b"),
        ]);
        for _ in 0..3 {
            let m = router.find(Method::Get, "/x/1").unwrap();
            assert_eq!(m.route.pattern, "/x/:a");
        }
    }

    fn auth_request(header: Option<&str>) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.set_method(Method::Get);
        req.set_uri("/admin/stats");
        if let Some(value) = header {
            req.set_header("Authorization", value);
        }
        req
    }

    #[test]
    fn basic_auth_guard() {
        let mut router = Router::new();
        router.add_basic_auth("/admin", "Admin Area", Credentials::single("admin", "secret123"));

        // no credentials
        match router.authenticate(&auth_request(None), AuthLevel::None) {
            AuthOutcome::Denied(realm) => assert_eq!(realm, "Admin Area"),
            AuthOutcome::Allowed(_) => panic!("expected 401"),
        }

        // wrong password: admin:wrong
        let bad = format!("Basic {}", BASE64.encode("admin:wrong"));
        assert!(matches!(
            router.authenticate(&auth_request(Some(&bad)), AuthLevel::None),
            AuthOutcome::Denied(_)
        ));

        // valid credentials attach the principal
        let good = format!("Basic {}", BASE64.encode("admin:secret123"));
        match router.authenticate(&auth_request(Some(&good)), AuthLevel::None) {
            AuthOutcome::Allowed(Some(user)) => assert_eq!(user, "admin"),
            _ => panic!("expected principal"),
        }
    }

    #[test]
    fn guard_prefixes_scope_requests() {
        let mut router = Router::new();
        router.add_basic_auth("/admin", "Admin", Credentials::single("admin", "pw"));
        let mut req = HttpRequest::new();
        req.set_uri("/public/page");
        assert!(matches!(
            router.authenticate(&req, AuthLevel::None),
            AuthOutcome::Allowed(None)
        ));
    }

    #[test]
    fn verify_predicate_credentials() {
        let creds = Credentials::verify(|user, password| {
            user.starts_with("guest_") && password == "guest"
        });
        let mut router = Router::new();
        router.add_basic_auth("/", "Zone", creds);

        let ok = format!("Basic {}", BASE64.encode("guest_42:guest"));
        assert!(matches!(
            router.authenticate(&auth_request(Some(&ok)), AuthLevel::None),
            AuthOutcome::Allowed(Some(_))
        ));
        let bad = format!("Basic {}", BASE64.encode("guest_42:nope"));
        assert!(matches!(
            router.authenticate(&auth_request(Some(&bad)), AuthLevel::None),
            AuthOutcome::Denied(_)
        ));
    }

    #[test]
    fn admin_level_requires_admin_principal() {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), "root".to_string());
        users.insert("bob".to_string(), "builder".to_string());
        let mut router = Router::new();
        router.add_basic_auth("/", "Zone", Credentials::map(users));

        let bob = format!("Basic {}", BASE64.encode("bob:builder"));
        assert!(matches!(
            router.authenticate(&auth_request(Some(&bob)), AuthLevel::Admin),
            AuthOutcome::Denied(_)
        ));
        let admin = format!("Basic {}", BASE64.encode("admin:root"));
        assert!(matches!(
            router.authenticate(&auth_request(Some(&admin)), AuthLevel::Admin),
            AuthOutcome::Allowed(Some(_))
        ));
    }
}
