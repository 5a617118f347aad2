//! Per-request retry state machine.
//!
//! One logical request loops through attempts until a classification
//! accepts the response or the budget runs out. Classification order:
//!
//! 1. budget exhausted — release the key, return the response as-is
//! 2. `-1` / 5xx (exclusive of 500) — fast retry, same key
//! 3. tolerant JSON parse; non-403 — accept, release the key
//! 4. 403 without a key — one credentialed retry
//!    403 with a key — freeze it per the classifier verdict and rotate,
//!    unless the verdict says not to retry
//!
//! Everything resolves to a response here; the only error that escapes is
//! connection-establishment exhaustion from the transport.

use crate::api::key_pool::{KeyPool, Release, DEFAULT_FREEZE};
use crate::api::transport::{
    AttemptTiming, GatewayResponse, RequestOptions, Timing, Transport, NO_RESPONSE,
};
use crate::error::GatewayError;
use http::HeaderName;
use log::{debug, error, warn};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Delay before re-attempting a transport failure or 5xx.
pub const FAST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What one classification step decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Terminal: hand the response to the caller.
    Accept,
    /// Re-attempt immediately, optionally with replaced options.
    RetryNow(Option<RequestOptions>),
    /// Re-attempt after a delay, optionally with replaced options.
    RetryAfter(Duration, Option<RequestOptions>),
}

/// Verdict of the 403 classifier for a key that hit a rate-limit wall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeVerdict {
    /// Freeze for a specific window, then rotate and retry.
    Freeze(Duration),
    /// Freeze for the default window, then rotate and retry.
    FreezeDefault,
    /// Freeze for the default window but do not retry this request.
    DoNotRetry,
}

/// Collaborator-supplied mapping from a parsed 403 error body to a
/// verdict. Consulted when the body carries a string `Error` field.
pub type Classifier = dyn Fn(&Value) -> FreezeVerdict + Send + Sync;

/// Drives attempts for one client instance. Owns no connection state;
/// the transport re-ensures the session on every attempt, so a dropped
/// connection and an exhausted key heal within one request's lifetime.
pub struct RetryDriver {
    pool: Arc<KeyPool>,
    key_name: HeaderName,
    classifier: Option<Arc<Classifier>>,
    timing: bool,
}

impl RetryDriver {
    pub fn new(pool: Arc<KeyPool>, key_name: HeaderName, timing: bool) -> Self {
        RetryDriver {
            pool,
            key_name,
            classifier: None,
            timing,
        }
    }

    pub fn set_classifier(&mut self, classifier: Arc<Classifier>) {
        self.classifier = Some(classifier);
    }

    /// Run one logical request to completion.
    ///
    /// `skip_key` suppresses the initial key attachment (the 403 healing
    /// path will still attach one on demand).
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        mut options: RequestOptions,
        max_retry: u32,
        skip_key: bool,
    ) -> Result<GatewayResponse, GatewayError> {
        let overall_start = Instant::now();
        transport.warm_up().await?;
        let connect_ms = overall_start.elapsed().as_millis() as u64;

        if !skip_key && options.header_str(&self.key_name).is_none() {
            self.attach_key(&mut options).await;
        }

        let mut trail: Vec<AttemptTiming> = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            // Establishment exhaustion aborts the request; the attached
            // key still has to go back to the pool.
            let outcome = match transport.send(&options, self.timing).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(key) = options.header_str(&self.key_name) {
                        self.pool.release(&key, Release::Normal).await;
                    }
                    return Err(e);
                }
            };
            if let Some(phase) = &outcome.phase {
                trail.push(phase.clone());
            }
            let mut response = GatewayResponse::from_outcome(outcome);
            debug!("attempt {attempt}/{max_retry}: code {}", response.code);

            match self.classify(&mut response, &mut options, attempt, max_retry).await {
                RetryDecision::Accept => {
                    if self.timing {
                        let last = trail.last().cloned().unwrap_or_default();
                        response.timing = Some(Timing {
                            connect: connect_ms,
                            request: last.request,
                            response: last.response,
                            total: overall_start.elapsed().as_millis() as u64,
                            attempts: trail,
                        });
                    }
                    return Ok(response);
                }
                RetryDecision::RetryNow(next) => {
                    if let Some(next) = next {
                        options = next;
                    }
                }
                RetryDecision::RetryAfter(delay, next) => {
                    if let Some(next) = next {
                        options = next;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    /// The ordered classification rules. Mutates `options` when a key is
    /// attached or rotated so the next attempt carries it.
    async fn classify(
        &self,
        response: &mut GatewayResponse,
        options: &mut RequestOptions,
        attempt: u32,
        max_retry: u32,
    ) -> RetryDecision {
        let code = response.code;
        let current_key = options.header_str(&self.key_name);

        // Rule 1: budget exhausted. Return the response untouched.
        if attempt >= max_retry {
            if let Some(key) = &current_key {
                self.pool.release(key, Release::Normal).await;
            }
            debug!("retry budget exhausted at code {code}");
            return RetryDecision::Accept;
        }

        // Rule 2: no response / 5xx storm. Same key, fast retry.
        if code == NO_RESPONSE || (code > 500 && code < 600) {
            return RetryDecision::RetryAfter(FAST_RETRY_DELAY, None);
        }

        // Rule 3: tolerant parse, then accept anything that is not a
        // credential problem. The key is reclaimed on completion.
        response.body.parse_json();
        if code != 403 {
            if let Some(key) = &current_key {
                self.pool.release(key, Release::Normal).await;
            }
            return RetryDecision::Accept;
        }

        // Rule 4: 403.
        match current_key {
            None => {
                // The attempt went out keyless; grant one credentialed retry.
                self.attach_key(options).await;
                debug!("403 without key, retrying with a credential");
                RetryDecision::RetryNow(None)
            }
            Some(key) => {
                let verdict = self.classify_403(response);
                match verdict {
                    Ok(FreezeVerdict::DoNotRetry) => {
                        self.pool.release(&key, Release::Freeze(DEFAULT_FREEZE)).await;
                        RetryDecision::Accept
                    }
                    Ok(FreezeVerdict::Freeze(window)) => {
                        self.pool.release(&key, Release::Freeze(window)).await;
                        self.rotate_key(options).await;
                        RetryDecision::RetryNow(None)
                    }
                    Ok(FreezeVerdict::FreezeDefault) => {
                        self.pool.release(&key, Release::Freeze(DEFAULT_FREEZE)).await;
                        self.rotate_key(options).await;
                        RetryDecision::RetryNow(None)
                    }
                    // A classifier that blew up must not hang the request.
                    Err(()) => {
                        self.pool.release(&key, Release::Normal).await;
                        RetryDecision::Accept
                    }
                }
            }
        }
    }

    /// Default policy: any string `Error` in the body consults the
    /// classifier (default answer: the fixed freeze window); bodies
    /// without one freeze for the default window as well.
    fn classify_403(&self, response: &GatewayResponse) -> Result<FreezeVerdict, ()> {
        let body = response
            .json()
            .filter(|v| v.get("Error").is_some_and(Value::is_string));
        match (body, &self.classifier) {
            (Some(body), Some(classifier)) => {
                catch_unwind(AssertUnwindSafe(|| classifier(body))).map_err(|_| {
                    error!("403 classifier panicked; accepting response without retry");
                })
            }
            _ => Ok(FreezeVerdict::FreezeDefault),
        }
    }

    /// Single-sweep key grab; a short result means "go keyless".
    async fn attach_key(&self, options: &mut RequestOptions) {
        let keys = self.pool.acquire(1, Duration::ZERO).await;
        match keys.first() {
            Some(key) => options.set_header(self.key_name.clone(), key),
            None => debug!("no key available, proceeding without one"),
        }
    }

    /// Replace the (frozen) key on the request if another one is free;
    /// otherwise the old header stays and the budget caps the loop.
    async fn rotate_key(&self, options: &mut RequestOptions) {
        let keys = self.pool.acquire(1, Duration::ZERO).await;
        if let Some(key) = keys.first() {
            options.set_header(self.key_name.clone(), key);
        } else {
            warn!("no replacement key available after freeze");
        }
    }
}
