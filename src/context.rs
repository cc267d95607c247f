//! Explicit per-request context and authorization guards.
//!
//! Every pipeline and retrieval entry point takes a [`RequestContext`] instead of reading
//! tenant identity from ambient state. Handlers call the guard functions first and branch on
//! the returned [`AccessDecision`].

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::models::Document;

/// Identity and budget of a single caller request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant the caller acts for.
    pub tenant_id: String,
    /// Authenticated user, when the transport supplies one.
    pub user_id: Option<String>,
    /// Absolute point after which work on behalf of this request should stop.
    pub deadline: Option<Instant>,
    /// Correlation identifier for logs.
    pub request_id: Uuid,
}

impl RequestContext {
    /// Context for `tenant_id` with no user and no deadline.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            deadline: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Attach the acting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Bound the request to `budget` from now.
    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Time left before the deadline; `None` when the request is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Smaller of the remaining deadline and `ceiling`.
    pub fn budget(&self, ceiling: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(ceiling),
            None => ceiling,
        }
    }
}

/// Outcome of an authorization guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The caller may proceed.
    Allowed,
    /// The caller must be rejected; the reason is safe to log but not to return verbatim.
    Denied(String),
}

impl AccessDecision {
    /// Whether the decision permits the operation.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Require a non-blank tenant identifier on the context.
pub fn authorize_tenant(ctx: &RequestContext) -> AccessDecision {
    if ctx.tenant_id.trim().is_empty() {
        return AccessDecision::Denied("missing tenant".into());
    }
    AccessDecision::Allowed
}

/// Require the document to belong to the caller's tenant.
pub fn authorize_document(ctx: &RequestContext, document: &Document) -> AccessDecision {
    match authorize_tenant(ctx) {
        AccessDecision::Allowed if document.tenant_id == ctx.tenant_id => AccessDecision::Allowed,
        AccessDecision::Allowed => AccessDecision::Denied(format!(
            "document {} belongs to another tenant",
            document.id
        )),
        denied => denied,
    }
}
