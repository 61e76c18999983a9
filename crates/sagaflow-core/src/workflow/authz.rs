//! Opaque capability check performed before every action invocation.
//!
//! The engine does not model users or roles. It asks an `Authorizer` whether
//! a permission tag may be exercised on behalf of an instance; a denial fails
//! the attempt with the non-retryable `AUTHORIZATION_DENIED` code.

use std::collections::HashSet;

use sagaflow_types::instance::WorkflowInstance;

/// Permission check port.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, permission: &str, instance: &WorkflowInstance) -> bool;
}

/// Grants every permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_allowed(&self, _permission: &str, _instance: &WorkflowInstance) -> bool {
        true
    }
}

/// Static set of granted permission tags.
///
/// `"*"` grants everything; `"finance.*"` grants every tag under `finance.`.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    granted: HashSet<String>,
}

impl PermissionSet {
    pub fn new<I, S>(granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: granted.into_iter().map(Into::into).collect(),
        }
    }

    fn grants(&self, permission: &str) -> bool {
        self.granted.iter().any(|g| {
            g == "*"
                || g == permission
                || g.strip_suffix(".*")
                    .is_some_and(|prefix| permission.starts_with(&format!("{prefix}.")))
        })
    }
}

impl Authorizer for PermissionSet {
    fn is_allowed(&self, permission: &str, instance: &WorkflowInstance) -> bool {
        let allowed = self.grants(permission);
        if !allowed {
            tracing::debug!(
                instance_id = %instance.id,
                permission,
                "permission not granted"
            );
        }
        allowed
    }
}
