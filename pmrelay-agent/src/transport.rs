//! Controller link
//!
//! One HTTP POST per push to `<controller>/api/agent`. There is no retry:
//! the next loop cycle is the retry.

use pmrelay_contracts::{ErrorBody, IngestRequest, IngestResponse, AGENT_PATH};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("controller rejected the host key: {0}")]
    Unauthorized(String),
    #[error("controller answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed controller response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub trait ControllerLink {
    async fn push(&self, request: &IngestRequest) -> Result<IngestResponse, TransportError>;
}

pub struct HttpLink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pmrelay-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint: format!("{}{}", base_url.trim_end_matches('/'), AGENT_PATH) })
    }
}

impl ControllerLink for HttpLink {
    async fn push(&self, request: &IngestRequest) -> Result<IngestResponse, TransportError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        decode_response(status, &body)
    }
}

fn decode_response(status: StatusCode, body: &str) -> Result<IngestResponse, TransportError> {
    if status == StatusCode::UNAUTHORIZED {
        let message = serde_json::from_str::<ErrorBody>(body).map(|b| b.error).unwrap_or_else(|_| body.to_string());
        return Err(TransportError::Unauthorized(message));
    }
    if !status.is_success() {
        return Err(TransportError::Status { status: status.as_u16(), body: body.chars().take(200).collect() });
    }
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records pushed requests and replays queued responses (ack when empty).
    #[derive(Default)]
    pub struct RecordingLink {
        pub pushed: Mutex<Vec<IngestRequest>>,
        pub replies: Mutex<VecDeque<Result<IngestResponse, TransportError>>>,
    }

    impl RecordingLink {
        pub fn reply(&self, reply: Result<IngestResponse, TransportError>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub fn kinds(&self) -> Vec<pmrelay_contracts::IngestKind> {
            self.pushed.lock().unwrap().iter().map(|r| r.kind).collect()
        }
    }

    impl ControllerLink for RecordingLink {
        async fn push(&self, request: &IngestRequest) -> Result<IngestResponse, TransportError> {
            self.pushed.lock().unwrap().push(request.clone());
            self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok(IngestResponse::ack()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrelay_contracts::CommandAction;

    #[test]
    fn test_decode_command_and_ack() {
        let ack = decode_response(StatusCode::OK, r#"{"success":true}"#).unwrap();
        assert_eq!(ack, IngestResponse::ack());

        let cmd = decode_response(StatusCode::OK, r#"{"command":{"action":"stop","process":"api","timestamp":1}}"#)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(cmd.action, CommandAction::Stop);
    }

    #[test]
    fn test_decode_errors() {
        let err = decode_response(StatusCode::UNAUTHORIZED, r#"{"error":"Invalid key"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized(ref m) if m == "Invalid key"));

        let err = decode_response(StatusCode::INTERNAL_SERVER_ERROR, "oops").unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));

        let err = decode_response(StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_endpoint_path() {
        let link = HttpLink::new("http://ctl:8080/", Duration::from_secs(10)).unwrap();
        assert_eq!(link.endpoint, "http://ctl:8080/api/agent");
    }
}
