//! API key rotation with quota failover.
//!
//! A call starts at the key the shared [`IndexStore`] points to and walks the
//! [`KeyPool`] at most once. Quota responses (HTTP 429) and transport
//! failures move the shared index forward and try the next key; any other
//! error status ends the call immediately, since a different key cannot fix
//! a malformed request.
//!
//! The walk is driven by [`Rotation`], a small state machine whose
//! transitions are pure and can be tested without I/O.

use crate::error::{EXHAUSTED_STATUS, RelayError, Result};
use crate::keys::KeyPool;
use crate::store::IndexStore;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upstream status that signals an exhausted quota.
pub const QUOTA_STATUS: u16 = 429;

/// The upstream could not be reached at all.
#[derive(Error, Debug)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// Raw upstream answer: status and body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body, verbatim.
    pub body: String,
}

/// Something that can send a request with a given API key.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Request type the upstream accepts.
    type Request: Send + Sync;

    /// Send `request` authenticated with `api_key`.
    async fn send(
        &self,
        api_key: &str,
        request: &Self::Request,
    ) -> std::result::Result<UpstreamReply, TransportError>;
}

/// What the rotation decided after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The key worked.
    Success,
    /// Quota or transport failure; move to the next key.
    AdvanceAndRetry,
    /// Non-retryable upstream error.
    FailFast,
}

/// One attempt within a call. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Pool position of the key used.
    pub key_index: usize,
    /// Upstream status, `None` on transport failure.
    pub status: Option<u16>,
    /// Outcome of the attempt.
    pub decision: Decision,
}

/// Sort an attempt outcome into success, retryable, or fail-fast.
pub fn classify(outcome: &std::result::Result<UpstreamReply, TransportError>) -> Decision {
    match outcome {
        Err(_) => Decision::AdvanceAndRetry,
        Ok(reply) if reply.status == QUOTA_STATUS => Decision::AdvanceAndRetry,
        Ok(reply) if (200..300).contains(&reply.status) => Decision::Success,
        Ok(_) => Decision::FailFast,
    }
}

/// States of a single rotating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// About to try the key at `index`.
    Attempting {
        /// Pool position to try.
        index: usize,
        /// Attempts already made.
        attempt: usize,
    },
    /// The last key failed retryably; the index moved to `next_index`.
    Retryable {
        /// Advanced pool position, to be persisted.
        next_index: usize,
        /// Attempts made so far.
        attempt: usize,
    },
    /// The key at `index` succeeded.
    Succeeded {
        /// Pool position that succeeded.
        index: usize,
    },
    /// The upstream rejected the request outright.
    FailFast {
        /// Pool position that was tried.
        index: usize,
    },
    /// Every key was tried.
    Exhausted {
        /// Attempts made.
        attempts: usize,
    },
}

/// Bounded walk over a pool of `pool_size` keys.
#[derive(Debug, Clone)]
pub struct Rotation {
    pool_size: usize,
    state: RotationState,
}

impl Rotation {
    /// Start at `index`, reduced into range.
    pub fn start(index: usize, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            pool_size,
            state: RotationState::Attempting {
                index: index % pool_size,
                attempt: 0,
            },
        }
    }

    /// Current state.
    pub fn state(&self) -> RotationState {
        self.state
    }

    /// Whether no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RotationState::Succeeded { .. }
                | RotationState::FailFast { .. }
                | RotationState::Exhausted { .. }
        )
    }

    /// Apply the outcome of the attempt in progress.
    ///
    /// Only valid in `Attempting`; other states are returned unchanged.
    pub fn record(&mut self, decision: Decision) -> RotationState {
        let RotationState::Attempting { index, attempt } = self.state else {
            return self.state;
        };
        self.state = match decision {
            Decision::Success => RotationState::Succeeded { index },
            Decision::FailFast => RotationState::FailFast { index },
            Decision::AdvanceAndRetry => RotationState::Retryable {
                next_index: (index + 1) % self.pool_size,
                attempt: attempt + 1,
            },
        };
        self.state
    }

    /// Leave `Retryable`: either attempt the next key or stop when every key
    /// was tried.
    pub fn resume(&mut self) -> RotationState {
        if let RotationState::Retryable {
            next_index,
            attempt,
        } = self.state
        {
            self.state = if attempt >= self.pool_size {
                RotationState::Exhausted { attempts: attempt }
            } else {
                RotationState::Attempting {
                    index: next_index,
                    attempt,
                }
            };
        }
        self.state
    }
}

/// A successful call.
#[derive(Debug, Clone)]
pub struct RotationSuccess {
    /// Success body, verbatim.
    pub body: String,
    /// Pool position of the key that worked.
    pub key_index: usize,
    /// Every attempt made, in order.
    pub attempts: Vec<AttemptRecord>,
}

/// Sends requests through a pool of keys, failing over on quota exhaustion.
#[derive(Debug, Clone)]
pub struct RotatingClient<U> {
    pool: Arc<KeyPool>,
    store: IndexStore,
    upstream: U,
}

impl<U: Upstream> RotatingClient<U> {
    /// Create a client over `pool`, coordinating through `store`.
    pub fn new(pool: Arc<KeyPool>, store: IndexStore, upstream: U) -> Self {
        Self {
            pool,
            store,
            upstream,
        }
    }

    /// The key pool.
    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// The shared index store.
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The upstream transport.
    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Send `request`, rotating keys on quota or transport failure.
    pub async fn call(&self, request: &U::Request) -> Result<RotationSuccess> {
        let start = self.store.read().await;
        let mut rotation = Rotation::start(start, self.pool.size());
        let mut attempts = Vec::with_capacity(self.pool.size());
        let mut last_reply = UpstreamReply::default();

        loop {
            match rotation.state() {
                RotationState::Attempting { index, attempt } => {
                    debug!(
                        key_index = index,
                        key = %self.pool.masked(index),
                        attempt = attempt + 1,
                        pool_size = self.pool.size(),
                        "Trying API key"
                    );

                    let outcome = self.upstream.send(self.pool.at(index), request).await;
                    let decision = classify(&outcome);
                    attempts.push(AttemptRecord {
                        key_index: index,
                        status: outcome.as_ref().ok().map(|r| r.status),
                        decision,
                    });
                    rotation.record(decision);

                    match outcome {
                        Ok(reply) => last_reply = reply,
                        Err(e) => warn!(
                            key_index = index,
                            error = %e,
                            "Upstream unreachable, rotating"
                        ),
                    }
                }
                RotationState::Retryable { next_index, .. } => {
                    if last_reply.status == QUOTA_STATUS {
                        warn!(next_index, "API key quota exhausted, rotating");
                    }
                    last_reply = UpstreamReply::default();
                    self.store.write(next_index).await;
                    rotation.resume();
                }
                RotationState::Succeeded { index } => {
                    info!(key_index = index, attempts = attempts.len(), "Upstream call succeeded");
                    return Ok(RotationSuccess {
                        body: last_reply.body,
                        key_index: index,
                        attempts,
                    });
                }
                RotationState::FailFast { index } => {
                    warn!(
                        key_index = index,
                        status = last_reply.status,
                        "Upstream rejected request, not retrying"
                    );
                    return Err(RelayError::UpstreamRequest {
                        status: last_reply.status,
                        body: last_reply.body,
                    });
                }
                RotationState::Exhausted { attempts: count } => {
                    warn!(
                        attempts = count,
                        status = EXHAUSTED_STATUS,
                        "All API keys exhausted"
                    );
                    return Err(RelayError::AllKeysExhausted { attempts: count });
                }
            }
        }
    }
}
