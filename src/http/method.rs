use std::fmt;

/// HTTP request methods.
///
/// Conversion from strings is total: anything that is not a known method
/// token maps to [`Method::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Connect,
    Trace,
    #[default]
    Unknown,
}

impl Method {
    /// The wire token for this method. [`Method::Unknown`] renders as
    /// `UNKNOWN` and is never valid on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Whether requests with this method carry no body by default.
    pub fn is_bodyless(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Delete | Method::Options)
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "OPTIONS" => Method::Options,
            "CONNECT" => Method::Connect,
            "TRACE" => Method::Trace,
            _ => Method::Unknown,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        for m in [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Options,
            Method::Connect,
            Method::Trace,
        ] {
            assert_eq!(Method::from(m.as_str()), m);
        }
    }

    #[test]
    fn unknown_tokens() {
        assert_eq!(Method::from("INVALID"), Method::Unknown);
        assert_eq!(Method::from("get"), Method::Unknown);
        assert_eq!(Method::from(""), Method::Unknown);
    }
}
