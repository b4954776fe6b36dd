//! Streaming download types.

/// One delivered chunk of a streaming download.
#[derive(Debug)]
pub struct StreamInfo<'a> {
    /// The chunk's bytes.
    pub data: &'a [u8],
    /// Total bytes delivered so far, this chunk included.
    pub downloaded: u64,
    /// `Content-Length` of the download, or `0` for chunked transfers.
    pub total: u64,
    /// HTTP status of the response being streamed.
    pub status_code: u16,
}

/// Final state of a streaming download.
///
/// `status_code == 0` together with a non-empty [`error`](Self::error)
/// means the transfer failed at the transport level before (or while)
/// streaming.
#[derive(Debug, Default, Clone)]
pub struct StreamResult {
    pub status_code: u16,
    pub error: String,
    pub bytes_transferred: u64,
}

impl StreamResult {
    /// Transport succeeded and the server answered 2xx.
    pub fn ok(&self) -> bool {
        self.error.is_empty() && (200..300).contains(&self.status_code)
    }

    /// A response (of any status) was fully processed.
    pub fn completed(&self) -> bool {
        self.status_code != 0
    }

    pub fn has_network_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn has_http_error(&self) -> bool {
        self.completed() && !(200..300).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state() {
        let result = StreamResult::default();
        assert_eq!(result.status_code, 0);
        assert!(result.error.is_empty());
        assert_eq!(result.bytes_transferred, 0);
        assert!(!result.ok());
        assert!(!result.completed());
    }

    #[test]
    fn success_state() {
        let result = StreamResult {
            status_code: 200,
            ..Default::default()
        };
        assert!(result.ok());
        assert!(result.completed());
        assert!(!result.has_network_error());
        assert!(!result.has_http_error());
    }

    #[test]
    fn http_error_state() {
        let result = StreamResult {
            status_code: 404,
            ..Default::default()
        };
        assert!(!result.ok());
        assert!(result.completed());
        assert!(!result.has_network_error());
        assert!(result.has_http_error());
    }

    #[test]
    fn network_error_state() {
        let result = StreamResult {
            error: "connection refused".to_string(),
            ..Default::default()
        };
        assert!(!result.ok());
        assert!(!result.completed());
        assert!(result.has_network_error());
        assert!(!result.has_http_error());
    }
}
