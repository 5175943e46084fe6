//! Shared `ureq` plumbing for the Key Vault, token and blob endpoints.

use std::{fmt, time::Duration};

pub(crate) const USER_AGENT: &str = concat!("blobcrypt/", env!("CARGO_PKG_VERSION"));

pub(crate) fn agent(connect_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect_timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// A non-2xx answer from a service, with whatever error code and
/// message the body carried.
#[derive(Debug)]
pub struct ServiceError {
    pub status: u16,
    pub error_code: Option<String>,
    pub message: String,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        if let Some(code) = &self.error_code {
            write!(f, " ({code})")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    pub(crate) fn from_response(status: u16, response: ureq::Response) -> Self {
        let header_code = response.header("x-ms-error-code").map(str::to_owned);
        let body = response.into_string().unwrap_or_default();
        let (body_code, message) = parse_error_body(&body);
        Self {
            status,
            error_code: header_code.or(body_code),
            message,
        }
    }
}

/// Turn a `ureq` failure into an `anyhow` error, keeping service
/// errors downcastable as [`ServiceError`].
pub(crate) fn into_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(status, response) => {
            ServiceError::from_response(status, response).into()
        }
        ureq::Error::Transport(transport) => anyhow::anyhow!("transport error: {transport}"),
    }
}

/// Extract `(code, message)` from the error bodies the services send:
/// Key Vault `{"error":{"code","message"}}`, Entra ID
/// `{"error","error_description"}`, or Storage XML `<Code>/<Message>`.
fn parse_error_body(body: &str) -> (Option<String>, String) {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let error = &json["error"];
        if let Some(message) = error["message"].as_str() {
            return (error["code"].as_str().map(str::to_owned), message.to_owned());
        }
        if let Some(description) = json["error_description"].as_str() {
            return (error.as_str().map(str::to_owned), first_line(description));
        }
    }
    if let Some(message) = xml_element(body, "Message") {
        return (xml_element(body, "Code"), first_line(&message));
    }
    (None, first_line(body))
}

fn xml_element(body: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_owned())
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_owned()
}
