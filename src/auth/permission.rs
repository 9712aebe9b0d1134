//! Stream permission checks

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::PermissionError;

/// Operation a permission is checked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Subscribe and resend
    Subscribe,
    Publish,
}

impl Operation {
    /// Permission name as used by the permission service
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Subscribe => "stream_subscribe",
            Operation::Publish => "stream_publish",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers whether a session may perform an operation on a stream
///
/// Implementations are expected to cache answers; the broker asks on every
/// subscribe, resend and unsigned publish.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check_permission(
        &self,
        stream_id: &str,
        session_token: Option<&str>,
        operation: Operation,
    ) -> Result<(), PermissionError>;
}

/// Grants every operation on every stream
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(
        &self,
        _stream_id: &str,
        _session_token: Option<&str>,
        _operation: Operation,
    ) -> Result<(), PermissionError> {
        Ok(())
    }
}

/// Fixed permission table
///
/// Unknown streams are `NotFound`. A grant without a token is public; any
/// other access requires a known token holding the grant. An unknown or
/// missing token is `Unauthenticated`, a known one without the grant is
/// `Forbidden`.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    streams: HashSet<String>,
    tokens: HashSet<String>,
    public: HashSet<(String, Operation)>,
    grants: HashMap<String, HashSet<(String, Operation)>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a stream that exists but grants nothing yet
    pub fn stream(mut self, stream_id: impl Into<String>) -> Self {
        self.streams.insert(stream_id.into());
        self
    }

    /// Declare a valid session token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }

    /// Allow an operation to anyone
    pub fn public(mut self, stream_id: impl Into<String>, operation: Operation) -> Self {
        let stream_id = stream_id.into();
        self.streams.insert(stream_id.clone());
        self.public.insert((stream_id, operation));
        self
    }

    /// Allow an operation to one session token
    pub fn grant(
        mut self,
        token: impl Into<String>,
        stream_id: impl Into<String>,
        operation: Operation,
    ) -> Self {
        let token = token.into();
        let stream_id = stream_id.into();
        self.streams.insert(stream_id.clone());
        self.tokens.insert(token.clone());
        self.grants
            .entry(token)
            .or_default()
            .insert((stream_id, operation));
        self
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check_permission(
        &self,
        stream_id: &str,
        session_token: Option<&str>,
        operation: Operation,
    ) -> Result<(), PermissionError> {
        if !self.streams.contains(stream_id) {
            return Err(PermissionError::NotFound);
        }

        let wanted = (stream_id.to_string(), operation);
        if self.public.contains(&wanted) {
            return Ok(());
        }

        let token = match session_token {
            Some(token) if self.tokens.contains(token) => token,
            _ => return Err(PermissionError::Unauthenticated),
        };

        match self.grants.get(token) {
            Some(grants) if grants.contains(&wanted) => Ok(()),
            _ => Err(PermissionError::Forbidden),
        }
    }
}
