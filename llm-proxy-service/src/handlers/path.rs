//! Session-scoped path parsing.

use std::borrow::Cow;
use thiserror::Error;

const SESSION_PREFIX: &str = "/v1/session/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Missing upstream endpoint. Use format: /v1/session/{{id}}/chat/completions")]
pub struct MalformedSessionPath;

/// Where an inbound path should be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    /// Present only for `/v1/session/{id}/<rest>` paths. Percent-decoded.
    pub session_id: Option<Cow<'a, str>>,
    pub upstream_path: String,
}

/// Split `/v1/session/{id}/<rest>` into the session id and `/v1/<rest>`.
///
/// Any other path, including `/v1/session/` with no id, is returned unchanged
/// with no session. A session path with nothing after the id is malformed.
/// The id is percent-decoded so it matches the `Path` extractor on the status
/// route; the remainder is forwarded as received.
pub fn session_route(path: &str) -> Result<Route<'_>, MalformedSessionPath> {
    let Some(after_prefix) = path.strip_prefix(SESSION_PREFIX) else {
        return Ok(passthrough(path));
    };

    let (session_id, rest) = match after_prefix.split_once('/') {
        Some((id, rest)) => (id, rest),
        None => (after_prefix, ""),
    };

    if session_id.is_empty() {
        return Ok(passthrough(path));
    }
    if rest.is_empty() {
        return Err(MalformedSessionPath);
    }

    Ok(Route {
        session_id: Some(decode_segment(session_id)),
        upstream_path: format!("/v1/{rest}"),
    })
}

fn decode_segment(segment: &str) -> Cow<'_, str> {
    match urlencoding::decode_binary(segment.as_bytes()) {
        Cow::Borrowed(bytes) => String::from_utf8_lossy(bytes),
        Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn passthrough(path: &str) -> Route<'_> {
    Route {
        session_id: None,
        upstream_path: path.to_string(),
    }
}
