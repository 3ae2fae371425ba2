use reqwest::StatusCode;
use thiserror::Error;

/// Longest error body kept on a `Status` error, in bytes.
pub const MAX_ERROR_BODY: usize = 512;

/// Failure of a single backend exchange.
///
/// Transport, non-success status and payload-shape failures are kept apart so
/// callers can log them differently, but none of them is fatal to polling.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    pub fn transport(endpoint: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { endpoint, source }
    }

    /// Non-success response. Bodies longer than [`MAX_ERROR_BODY`] are cut on a
    /// char boundary so an HTML error page never lands whole in a log line.
    pub fn status(endpoint: &'static str, status: StatusCode, mut body: String) -> Self {
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push_str("...");
        }
        Self::Status {
            endpoint,
            status,
            body,
        }
    }

    pub fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { what, source }
    }

    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Transport { .. } => "transport",
            ClientError::Status { .. } => "status",
            ClientError::Decode { .. } => "decode",
        }
    }

    /// Backend-supplied `detail` message, when the error body carries one.
    pub fn detail(&self) -> Option<String> {
        let ClientError::Status { body, .. } = self else {
            return None;
        };
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        value
            .get("detail")
            .and_then(|detail| detail.as_str())
            .map(|detail| detail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_read_from_status_body() {
        let err = ClientError::Status {
            endpoint: "control-misting",
            status: StatusCode::BAD_REQUEST,
            body: r#"{"detail":"Invalid action. Use 'ON' or 'OFF'"}"#.to_string(),
        };
        assert_eq!(err.kind(), "status");
        assert_eq!(
            err.detail().as_deref(),
            Some("Invalid action. Use 'ON' or 'OFF'")
        );
    }

    #[test]
    fn oversized_status_bodies_are_truncated() {
        let err = ClientError::status(
            "historical-data",
            StatusCode::BAD_GATEWAY,
            "x".repeat(10 * 1024),
        );
        let ClientError::Status { body, .. } = &err else {
            panic!("expected status error");
        };
        assert_eq!(body.len(), MAX_ERROR_BODY + 3);
        assert!(body.ends_with("..."));
        assert!(err.to_string().len() < 1024);

        // Three-byte chars never line up with the cap; the cut must back off.
        let err = ClientError::status("sensor-data", StatusCode::BAD_GATEWAY, "€".repeat(400));
        let ClientError::Status { body, .. } = err else {
            panic!("expected status error");
        };
        assert!(body.len() <= MAX_ERROR_BODY + 3);
        assert!(body.trim_end_matches("...").chars().all(|c| c == '€'));

        let short = ClientError::status("sensor-data", StatusCode::NOT_FOUND, "gone".to_string());
        assert!(matches!(short, ClientError::Status { ref body, .. } if body == "gone"));
    }

    #[test]
    fn detail_is_absent_for_plain_bodies() {
        let err = ClientError::Status {
            endpoint: "sensor-data",
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "Internal Server Error".to_string(),
        };
        assert!(err.detail().is_none());
        assert!(err.to_string().contains("500"));
    }
}
