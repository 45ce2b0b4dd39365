//! Command Context
//!
//! Carries the acting principal and tenant scope of an operation,
//! plus tracing metadata and the command deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Identity of the `creator` column when no user is acting.
pub const SYSTEM_USER: &str = "system";

/// Context for a command, used for scoping, auditing and tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Tenant boundary; every event belongs to exactly one instance
    pub instance_id: String,

    /// Organization scope of the request, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,

    /// Acting user, when authenticated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,

    /// Absolute deadline; I/O past this point is abandoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Context {
    /// Create a new context scoped to an instance
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            org_id: None,
            user_id: None,
            request_id: None,
            deadline: None,
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The principal recorded as event creator
    pub fn creator(&self) -> String {
        self.user_id
            .clone()
            .unwrap_or_else(|| SYSTEM_USER.to_string())
    }

    /// Generate a new request ID if not present
    pub fn ensure_request_id(&mut self) -> Uuid {
        *self.request_id.get_or_insert_with(Uuid::new_v4)
    }

    /// Fail with `DeadlineExceeded` if the command deadline has elapsed.
    /// Called before every event-store round trip.
    pub fn check_deadline(&self) -> AppResult<()> {
        match self.deadline {
            Some(deadline) if Utc::now() >= deadline => Err(AppError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_context_builder() {
        let request_id = Uuid::new_v4();
        let ctx = Context::new("inst-1")
            .with_org("org-1")
            .with_user("user-1")
            .with_request_id(request_id);

        assert_eq!(ctx.instance_id, "inst-1");
        assert_eq!(ctx.org_id.as_deref(), Some("org-1"));
        assert_eq!(ctx.creator(), "user-1");
        assert_eq!(ctx.request_id, Some(request_id));
    }

    #[test]
    fn test_creator_falls_back_to_system() {
        let ctx = Context::new("inst-1");
        assert_eq!(ctx.creator(), SYSTEM_USER);
    }

    #[test]
    fn test_deadline_check() {
        let ctx = Context::new("inst-1");
        assert!(ctx.check_deadline().is_ok());

        let expired = Context::new("inst-1").with_deadline(Utc::now() - Duration::seconds(1));
        assert!(matches!(
            expired.check_deadline(),
            Err(AppError::DeadlineExceeded)
        ));

        let future = Context::new("inst-1").with_deadline(Utc::now() + Duration::seconds(60));
        assert!(future.check_deadline().is_ok());
    }

    #[test]
    fn test_ensure_request_id() {
        let mut ctx = Context::new("inst-1");
        assert!(ctx.request_id.is_none());

        let id = ctx.ensure_request_id();
        assert_eq!(ctx.request_id, Some(id));
        assert_eq!(ctx.ensure_request_id(), id);
    }
}
