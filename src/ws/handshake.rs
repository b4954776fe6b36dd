//! WebSocket opening handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::http::{Method, Request, Response, StatusCode};
use crate::{Error, Result};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// A fresh random 16-byte key, base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Validates a server-side upgrade request and returns the accept value to
/// answer with. Checks method, `Upgrade`/`Connection` headers, version 13
/// and a well-formed 16-byte key.
pub fn validate_upgrade(req: &Request) -> Result<String> {
    if req.method() != Method::Get {
        return Err(Error::Parse("websocket upgrade requires GET".into()));
    }
    if !req
        .header("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(Error::Parse("missing Upgrade: websocket".into()));
    }
    if !req.headers().has_token("Connection", "upgrade") {
        return Err(Error::Parse("missing Connection: Upgrade".into()));
    }
    if req.header("Sec-WebSocket-Version") != Some("13") {
        return Err(Error::Parse("unsupported websocket version".into()));
    }
    let key = req
        .header("Sec-WebSocket-Key")
        .ok_or_else(|| Error::Parse("missing Sec-WebSocket-Key".into()))?;
    let decoded = BASE64
        .decode(key.trim())
        .map_err(|_| Error::Parse("malformed Sec-WebSocket-Key".into()))?;
    if decoded.len() != 16 {
        return Err(Error::Parse("malformed Sec-WebSocket-Key".into()));
    }
    Ok(accept_key(key.trim()))
}

/// The `101 Switching Protocols` reply for a validated upgrade.
pub fn upgrade_response(accept: &str) -> Response {
    let mut res = Response::new(StatusCode::SwitchingProtocols);
    res.headers_mut().set("Upgrade", "websocket");
    res.headers_mut().set("Connection", "Upgrade");
    res.headers_mut().set("Sec-WebSocket-Accept", accept);
    res
}

/// Decorates a client request with the upgrade headers for `key`.
pub fn apply_client_headers(req: &mut Request, key: &str) {
    req.set_method(Method::Get);
    req.headers_mut().set("Upgrade", "websocket");
    req.headers_mut().set("Connection", "Upgrade");
    req.headers_mut().set("Sec-WebSocket-Key", key);
    req.headers_mut().set("Sec-WebSocket-Version", "13");
}

/// Verifies the server's handshake reply against the key we sent.
pub fn verify_accept(key: &str, res: &Response) -> Result<()> {
    if res.status() != StatusCode::SwitchingProtocols {
        return Err(Error::Parse(format!(
            "unexpected handshake status {}",
            res.status()
        )));
    }
    if !res
        .header("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(Error::Parse("missing Upgrade header in reply".into()));
    }
    match res.header("Sec-WebSocket-Accept") {
        Some(got) if got.trim() == accept_key(key) => Ok(()),
        Some(_) => Err(Error::Parse("Sec-WebSocket-Accept mismatch".into())),
        None => Err(Error::Parse("missing Sec-WebSocket-Accept".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(key: &str) -> Request {
        let mut req = Request::new();
        req.set_method(Method::Get);
        req.set_uri("/chat");
        req.set_header("Host", "example.com");
        req.set_header("Upgrade", "websocket");
        req.set_header("Connection", "keep-alive, Upgrade");
        req.set_header("Sec-WebSocket-Key", key);
        req.set_header("Sec-WebSocket-Version", "13");
        req
    }

    #[test]
    fn rfc_sample_accept_value() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn validates_well_formed_upgrade() {
        let req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==");
        let accept = validate_upgrade(&req).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let res = upgrade_response(&accept);
        assert_eq!(res.status(), StatusCode::SwitchingProtocols);
        assert_eq!(res.header("Sec-WebSocket-Accept"), Some(accept.as_str()));
    }

    #[test]
    fn rejects_defective_upgrades() {
        let mut req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==");
        req.set_method(Method::Post);
        assert!(validate_upgrade(&req).is_err());

        let mut req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==");
        req.headers_mut().remove("Upgrade");
        assert!(validate_upgrade(&req).is_err());

        let mut req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==");
        req.set_header("Sec-WebSocket-Version", "8");
        assert!(validate_upgrade(&req).is_err());

        // a key that is not 16 bytes
        let req = upgrade_request("c2hvcnQ=");
        assert!(validate_upgrade(&req).is_err());
    }

    #[test]
    fn client_handshake_round_trip() {
        let key = generate_key();
        let mut req = Request::build(Method::Get, "http://example.com/ws").unwrap();
        apply_client_headers(&mut req, &key);

        let accept = validate_upgrade(&req).unwrap();
        let res = upgrade_response(&accept);
        verify_accept(&key, &res).unwrap();

        // tampered accept must fail
        let mut bad = upgrade_response(&accept);
        bad.set_header("Sec-WebSocket-Accept", "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert!(verify_accept(&key, &bad).is_err());
    }

    #[test]
    fn fresh_keys_differ() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
    }
}
