//! Resend sessions
//!
//! A session couples a historical message stream with a cancellation token.
//! Pulling from the session honours the destination connection's
//! backpressure signal, so a slow client pauses the source instead of
//! growing the outbound buffer.

use std::time::Instant;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ResendError;
use crate::protocol::StreamMessage;

use super::source::MessageStream;

/// One running resend
pub struct ResendSession {
    handle: ResendHandle,
    source: MessageStream,
}

/// Cheap handle used to abort a session from elsewhere
#[derive(Debug, Clone)]
pub struct ResendHandle {
    id: u64,
    token: CancellationToken,
    started_at: Instant,
}

impl ResendHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Stop the session; aborting twice or after completion is a no-op
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl ResendSession {
    pub fn new(id: u64, source: MessageStream) -> Self {
        Self {
            handle: ResendHandle {
                id,
                token: CancellationToken::new(),
                started_at: Instant::now(),
            },
            source,
        }
    }

    pub fn handle(&self) -> ResendHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    /// Next historical message
    ///
    /// Waits while `backpressure` is raised. Returns `None` when the source
    /// is exhausted, the session was aborted, or the signal's connection is
    /// gone.
    pub async fn next(
        &mut self,
        backpressure: &mut watch::Receiver<bool>,
    ) -> Option<Result<StreamMessage, ResendError>> {
        let token = self.handle.token.clone();

        let writable = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            released = async { backpressure.wait_for(|high| !*high).await.is_ok() } => released,
        };
        if !writable {
            return None;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = self.source.next() => item,
        }
    }
}
