//! Session-scoped stream-token generator.
//!
//! A single token-producing resource is expensive to build and can die
//! silently when its host tears down the execution context. The generator
//! keeps at most one live resource, bound to one session id:
//!
//! - the decide-and-maybe-recreate step runs under one async mutex,
//! - token computation runs outside the lock, so concurrent requests against a
//!   valid resource proceed in parallel,
//! - a failed computation on a reused resource is retried exactly once on a
//!   freshly recreated one; a failure on a fresh resource is returned as is.
//!
//! Hosts that can never produce tokens are detected once and the generator
//! then answers `Ok(None)` for the rest of the process lifetime.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::errors::TokenError;

/// Authorization token attached to protected stream requests.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamToken(String);

impl StreamToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamToken({} chars)", self.0.len())
    }
}

/// The stateful object able to derive tokens for one session.
#[async_trait]
pub trait TokenResource: Send + Sync {
    fn is_expired(&self) -> bool;
    async fn generate_token(&self, video_id: &str) -> Result<StreamToken, TokenError>;
    /// Tears the resource down on whatever execution context it lives on.
    async fn close(&self);
}

/// Sandboxed environment that constructs token resources.
#[async_trait]
pub trait TokenResourceHost: Send + Sync {
    /// Cheap probe; `false` means the host can never produce tokens.
    fn is_supported(&self) -> bool;
    /// Fails with `TokenError::HostUnavailable` when the host turns out to be unusable.
    async fn create(&self, session_id: &str) -> Result<Arc<dyn TokenResource>, TokenError>;
}

struct TokenSession {
    session_id: String,
    resource: Arc<dyn TokenResource>,
}

pub struct TokenGenerator {
    host: Arc<dyn TokenResourceHost>,
    unavailable: AtomicBool,
    released: AtomicBool,
    slot: Mutex<Option<TokenSession>>,
}

impl TokenGenerator {
    pub fn new(host: Arc<dyn TokenResourceHost>) -> Self {
        let unavailable = !host.is_supported();
        if unavailable {
            info!("TokenGenerator: host does not support token generation");
        }
        Self {
            host,
            unavailable: AtomicBool::new(unavailable),
            released: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::Acquire) && !self.released.load(Ordering::Acquire)
    }

    /// Returns a token for `video_id`, or `None` when this host can never produce one.
    pub async fn get_token(
        &self,
        video_id: &str,
        session_id: &str,
    ) -> Result<Option<StreamToken>, TokenError> {
        if self.released.load(Ordering::Acquire) {
            return Err(TokenError::Released);
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Ok(None);
        }
        debug!("TokenGenerator: token requested video={video_id} session={session_id}");

        match self.generate(video_id, session_id).await {
            Ok(token) => Ok(Some(token)),
            Err(TokenError::HostUnavailable(reason)) => {
                warn!(
                    "TokenGenerator: disabling token generation for this process: {}",
                    reason
                );
                self.unavailable.store(true, Ordering::Release);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn generate(&self, video_id: &str, session_id: &str) -> Result<StreamToken, TokenError> {
        let mut force_recreate = false;
        loop {
            let (resource, recreated) = self.acquire(session_id, force_recreate).await?;
            match resource.generate_token(video_id).await {
                Ok(token) => {
                    debug!("TokenGenerator: [{video_id}] token ready");
                    return Ok(token);
                }
                Err(err) if recreated => return Err(err),
                Err(err) => {
                    warn!(
                        "TokenGenerator: token generation failed on reused resource, recreating: {}",
                        err
                    );
                    force_recreate = true;
                }
            }
        }
    }

    /// Returns the live resource for `session_id` and whether it was built by this call.
    async fn acquire(
        &self,
        session_id: &str,
        force_recreate: bool,
    ) -> Result<(Arc<dyn TokenResource>, bool), TokenError> {
        let mut slot = self.slot.lock().await;
        if self.released.load(Ordering::Acquire) {
            return Err(TokenError::Released);
        }
        let reusable = slot.as_ref().filter(|current| {
            !force_recreate
                && current.session_id == session_id
                && !current.resource.is_expired()
        });
        if let Some(current) = reusable {
            return Ok((Arc::clone(&current.resource), false));
        }

        if let Some(stale) = slot.take() {
            debug!(
                "TokenGenerator: closing resource for session {}",
                stale.session_id
            );
            stale.resource.close().await;
        }
        let resource = self.host.create(session_id).await?;
        *slot = Some(TokenSession {
            session_id: session_id.to_string(),
            resource: Arc::clone(&resource),
        });
        Ok((resource, true))
    }

    /// Closes the live resource; later requests fail with `TokenError::Released`.
    pub async fn release(&self) {
        let mut slot = self.slot.lock().await;
        self.released.store(true, Ordering::Release);
        if let Some(current) = slot.take() {
            current.resource.close().await;
        }
    }
}
