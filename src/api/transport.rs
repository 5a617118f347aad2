//! Wire types and the single-attempt transport.
//!
//! The transport sends exactly one attempt: ensure a live session, open a
//! stream, accumulate the response. It never retries; the retry driver
//! owns that loop. A failed stream comes back as an outcome with
//! `code == -1` and the error text in the body, never as `Err` — only
//! connection-establishment exhaustion propagates.

use crate::api::connection::ConnectionManager;
use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Sentinel status for an attempt that never received a response.
pub const NO_RESPONSE: i32 = -1;

/// One request as the engine sees it: method, path, headers, optional
/// payload. A pre-attached key rides in the headers like any other field.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub payload: Option<Bytes>,
}

impl RequestOptions {
    pub fn get(path: impl Into<String>) -> Self {
        RequestOptions {
            method: Method::GET,
            path: path.into(),
            headers: HeaderMap::new(),
            payload: None,
        }
    }

    pub fn post(path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        RequestOptions {
            method: Method::POST,
            path: path.into(),
            headers: HeaderMap::new(),
            payload: Some(payload.into()),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }
}

/// Phase durations of one attempt, milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttemptTiming {
    pub request: u64,
    pub response: u64,
    pub total: u64,
}

/// Full timing breakdown attached to a response when timing capture is on.
/// `request`/`response` mirror the final attempt; `attempts` is the whole
/// per-attempt trail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timing {
    pub connect: u64,
    pub request: u64,
    pub response: u64,
    pub total: u64,
    pub attempts: Vec<AttemptTiming>,
}

/// Raw result of one attempt, before classification.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub code: i32,
    pub headers: HeaderMap,
    pub body: String,
    pub phase: Option<AttemptTiming>,
}

impl AttemptOutcome {
    /// Transport-level failure: no response was received.
    pub fn failure(reason: String) -> Self {
        AttemptOutcome {
            code: NO_RESPONSE,
            headers: HeaderMap::new(),
            body: reason,
            phase: None,
        }
    }
}

/// Response body, kept raw until classification tries a tolerant JSON
/// parse. A parse failure leaves the raw text in place.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Json(Value),
}

impl ResponseBody {
    pub fn from_raw(raw: String) -> Self {
        if raw.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Text(raw)
        }
    }

    /// Attempt a JSON parse in place; tolerated silently on failure.
    pub fn parse_json(&mut self) {
        if let ResponseBody::Text(raw) = self {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                *self = ResponseBody::Json(value);
            }
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_json_mut(&mut self) -> Option<&mut Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(raw) => Some(raw),
            _ => None,
        }
    }
}

/// What the caller receives: final status (or `-1`), headers, body and an
/// optional timing breakdown. Exhausted retries return the last observed
/// response here rather than raising.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub code: i32,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub timing: Option<Timing>,
}

impl GatewayResponse {
    pub fn from_outcome(outcome: AttemptOutcome) -> Self {
        GatewayResponse {
            code: outcome.code,
            headers: outcome.headers,
            body: ResponseBody::from_raw(outcome.body),
            timing: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    pub fn json(&self) -> Option<&Value> {
        self.body.as_json()
    }
}

/// Seam between the retry driver and the wire. Production uses
/// [`Http2Transport`]; tests script outcomes through a mock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare whatever the first attempt needs (session establishment).
    /// Also the hook the timing capture uses to meter the connect phase.
    async fn warm_up(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Send one attempt. `Err` only for connection-establishment
    /// exhaustion; stream-level failures come back as `code == -1`.
    async fn send(&self, options: &RequestOptions, timing: bool) -> Result<AttemptOutcome, GatewayError>;
}

/// Production transport over the managed HTTP/2 session.
pub struct Http2Transport {
    manager: Arc<ConnectionManager>,
    connect_attempts: u32,
}

impl Http2Transport {
    pub fn new(manager: Arc<ConnectionManager>, connect_attempts: u32) -> Self {
        Http2Transport {
            manager,
            connect_attempts,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The h2-level exchange. Any error here means the attempt produced
    /// no usable response; the caller maps it to a `-1` outcome.
    async fn exchange(
        &self,
        options: &RequestOptions,
        timing: bool,
    ) -> anyhow::Result<AttemptOutcome> {
        let session = self.manager.ensure_session(self.connect_attempts).await?;
        let start = timing.then(Instant::now);

        let mut builder = http::Request::builder()
            .method(options.method.clone())
            .uri(format!("{}{}", self.manager.origin(), options.path));
        for (name, value) in options.headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder.body(())?;

        let mut sender = session.sender().ready().await?;
        let (response, mut stream) =
            sender.send_request(request, options.payload.is_none())?;
        if let Some(payload) = &options.payload {
            stream.send_data(payload.clone(), true)?;
        }
        let request_ms = start.map(|t| t.elapsed().as_millis() as u64);

        let response = response.await?;
        let (parts, mut body) = response.into_parts();
        let mut data = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            let _ = body.flow_control().release_capacity(chunk.len());
            data.extend_from_slice(&chunk);
        }

        let phase = start.map(|t| {
            let total = t.elapsed().as_millis() as u64;
            let request = request_ms.unwrap_or(0);
            AttemptTiming {
                request,
                response: total.saturating_sub(request),
                total,
            }
        });
        Ok(AttemptOutcome {
            code: parts.status.as_u16() as i32,
            headers: parts.headers,
            body: String::from_utf8_lossy(&data).into_owned(),
            phase,
        })
    }
}

#[async_trait]
impl Transport for Http2Transport {
    async fn warm_up(&self) -> Result<(), GatewayError> {
        self.manager.ensure_session(self.connect_attempts).await?;
        Ok(())
    }

    async fn send(&self, options: &RequestOptions, timing: bool) -> Result<AttemptOutcome, GatewayError> {
        match self.exchange(options, timing).await {
            Ok(outcome) => Ok(outcome),
            // Establishment exhaustion is fatal for this request.
            Err(e) if e.is::<GatewayError>() => match e.downcast::<GatewayError>() {
                Ok(gateway_err) => Err(gateway_err),
                Err(e) => Ok(AttemptOutcome::failure(format!("{e:#}"))),
            },
            // Stream-level failure: report it as "no response received".
            Err(e) => Ok(AttemptOutcome::failure(format!("{e:#}"))),
        }
    }
}
