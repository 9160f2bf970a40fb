//! Access checks performed when a connection attaches to a document.

use std::sync::Arc;

use crate::config::AccessPolicy;
use crate::protocol::{DocumentId, UserId};
use crate::storage::AccessSource;

/// Result of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// External authorization collaborator.
pub trait PermissionGate: Send + Sync {
    fn check_access(&self, user: &UserId, doc: &DocumentId) -> Access;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn check_access(&self, _user: &UserId, _doc: &DocumentId) -> Access {
        Access::Allowed
    }
}

/// Owner, collaborator or public document, read from an [`AccessSource`].
///
/// A missing or unreadable access record denies.
pub struct AclGate {
    source: Arc<dyn AccessSource>,
}

impl AclGate {
    pub fn new(source: Arc<dyn AccessSource>) -> Self {
        Self { source }
    }
}

impl PermissionGate for AclGate {
    fn check_access(&self, user: &UserId, doc: &DocumentId) -> Access {
        match self.source.load_access(doc) {
            Ok(Some(access)) if access.permits(user) => Access::Allowed,
            Ok(Some(_)) => Access::Denied,
            Ok(None) => {
                log::debug!("No access record for document {doc}");
                Access::Denied
            }
            Err(e) => {
                log::error!("Access lookup failed for document {doc}: {e}");
                Access::Denied
            }
        }
    }
}

/// Wraps a gate and allows whatever it would have denied, with a warning.
pub struct Permissive<G> {
    inner: G,
}

impl<G: PermissionGate> Permissive<G> {
    pub fn new(inner: G) -> Self {
        Self { inner }
    }
}

impl<G: PermissionGate> PermissionGate for Permissive<G> {
    fn check_access(&self, user: &UserId, doc: &DocumentId) -> Access {
        if self.inner.check_access(user, doc) == Access::Denied {
            log::warn!("Access for user {user} on document {doc} would be denied; allowing (permissive policy)");
        }
        Access::Allowed
    }
}

/// Gate for an access policy over the given ACL source.
pub fn gate_for(policy: AccessPolicy, source: Arc<dyn AccessSource>) -> Arc<dyn PermissionGate> {
    match policy {
        AccessPolicy::Enforce => Arc::new(AclGate::new(source)),
        AccessPolicy::Permissive => Arc::new(Permissive::new(AclGate::new(source))),
    }
}
