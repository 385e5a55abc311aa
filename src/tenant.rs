use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineError;
use crate::limits::*;

/// Tenant identifier. Every store query is scoped by one of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate a tenant name. Only alphanumerics, `_` and `-` are allowed.
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(EngineError::validation("tenant name too long"));
        }
        if name.is_empty() {
            return Err(EngineError::validation("empty tenant name"));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::validation(format!(
                "tenant name contains invalid characters: {name:?}"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-call context: explicit tenant scope plus caller cancellation.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub tenant: TenantId,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the caller has given up.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EngineError::Timeout);
        }
        Ok(())
    }

    /// Race a read against cancellation and the deadline, bounded by `store_timeout`.
    pub async fn read<T, E, F>(&self, store_timeout: Duration, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        self.check()?;
        let limit = match self.deadline {
            Some(d) => d.min(Instant::now() + store_timeout),
            None => Instant::now() + store_timeout,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            res = tokio::time::timeout_at(limit, fut) => match res {
                Ok(r) => r.map_err(Into::into),
                Err(_) => Err(EngineError::Timeout),
            },
        }
    }

    /// Wait on `fut` (a lock, usually) for as long as the caller is willing to.
    /// Unlike `read` no store timeout applies; only cancellation and the deadline.
    pub async fn wait<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        let bounded = async {
            match self.deadline {
                Some(d) => tokio::time::timeout_at(d, fut)
                    .await
                    .map_err(|_| EngineError::Timeout),
                None => Ok(fut.await),
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            res = bounded => res,
        }
    }

    /// Issue a commit. Checked for cancellation before it starts, never interrupted after:
    /// a single store commit either lands entirely or not at all.
    pub async fn commit<T, E, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        self.check()?;
        fut.await.map_err(Into::into)
    }
}
