//! Percent and form encoding per RFC 3986 §2.3.
//!
//! Unreserved characters (alphanumerics, `-`, `_`, `.`, `~`) pass through;
//! everything else becomes `%HH`. Form encoding additionally writes spaces
//! as `+`; decoding maps `+` back to a space in both flavors.

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn encode_with(input: &[u8], keep: impl Fn(u8) -> bool, plus_for_space: bool) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 4);
    for &b in input {
        if keep(b) {
            out.push(b as char);
        } else if plus_for_space && b == b' ' {
            out.push('+');
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}

/// Percent-encode arbitrary bytes. Spaces become `%20`.
pub fn encode(input: impl AsRef<[u8]>) -> String {
    encode_with(input.as_ref(), is_unreserved, false)
}

/// Percent-encode a path, preserving `/` separators.
pub fn encode_path(input: impl AsRef<[u8]>) -> String {
    encode_with(input.as_ref(), |b| is_unreserved(b) || b == b'/', false)
}

fn form_encode_component(input: &str) -> String {
    encode_with(input.as_bytes(), is_unreserved, true)
}

/// Strict decode to raw bytes. Returns `None` on a truncated or invalid
/// percent escape. `+` decodes to a space.
pub fn decode_bytes(input: &str) -> Option<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

/// Strict decode to a string. Fails on invalid escapes or non-UTF-8 output.
pub fn decode(input: &str) -> Option<String> {
    String::from_utf8(decode_bytes(input)?).ok()
}

/// Lenient decode: an invalid input yields the empty string.
pub fn decode_lossy(input: &str) -> String {
    decode(input).unwrap_or_default()
}

/// Parses `application/x-www-form-urlencoded` data into an ordered multimap.
/// Pairs split on `&`, key and value on the first `=`; pairs with an empty
/// key are skipped; duplicate keys are preserved in order.
pub fn parse_form(data: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in data.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if key.is_empty() {
            continue;
        }
        out.push((decode_lossy(key), decode_lossy(value)));
    }
    out
}

/// Serializes an ordered multimap as `application/x-www-form-urlencoded`.
pub fn encode_form<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&form_encode_component(key));
        out.push('=');
        out.push_str(&form_encode_component(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn encode_unreserved_pass_through() {
        assert_eq!(encode("hello"), "hello");
        assert_eq!(encode("a-b_c.d~e"), "a-b_c.d~e");
    }

    #[test]
    fn encode_reserved() {
        assert_eq!(encode("foo@bar.com"), "foo%40bar.com");
        assert_eq!(encode("100%"), "100%25");
        assert_eq!(encode("a=b&c=d"), "a%3Db%26c%3Dd");
        assert_eq!(encode("hello world"), "hello%20world");
    }

    #[test]
    fn encode_multibyte() {
        assert_eq!(encode("José"), "Jos%C3%A9");
        assert_eq!(encode("日本語"), "%E6%97%A5%E6%9C%AC%E8%AA%9E");
    }

    #[test]
    fn path_preserves_slashes() {
        assert_eq!(encode_path("/a b/c"), "/a%20b/c");
    }

    #[test]
    fn decode_basics() {
        assert_eq!(decode("Hello+World").as_deref(), Some("Hello World"));
        assert_eq!(decode("foo%40bar.com").as_deref(), Some("foo@bar.com"));
        assert_eq!(decode("100%25").as_deref(), Some("100%"));
    }

    #[test]
    fn decode_rejects_bad_escapes() {
        assert_eq!(decode("%"), None);
        assert_eq!(decode("%1"), None);
        assert_eq!(decode("%zz"), None);
        assert_eq!(decode_lossy("%zz"), "");
    }

    #[test]
    fn form_round_trip() {
        let pairs = vec![
            ("email".to_string(), "user@example.com".to_string()),
            ("message".to_string(), "Hello World!".to_string()),
            ("message".to_string(), "again".to_string()),
        ];
        let encoded = encode_form(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        assert_eq!(
            encoded,
            "email=user%40example.com&message=Hello+World%21&message=again"
        );
        assert_eq!(parse_form(&encoded), pairs);
    }

    #[test]
    fn form_parse_edge_cases() {
        assert_eq!(parse_form(""), vec![]);
        // empty keys are skipped, valueless keys keep an empty value
        assert_eq!(
            parse_form("=x&a=1&b"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), String::new())
            ]
        );
    }

    quickcheck! {
        fn percent_round_trip(data: Vec<u8>) -> bool {
            decode_bytes(&encode(&data)).as_deref() == Some(data.as_slice())
        }

        fn string_round_trip(s: String) -> bool {
            decode(&encode(&s)).as_deref() == Some(s.as_str())
        }
    }
}
