use thiserror::Error;
use uuid::Uuid;

use crate::rbac::{Permission, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrgError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("organization not found: {0}")]
    OrgNotFound(Uuid),
    #[error("user `{user}` is not a member of {org}")]
    NotMember { org: Uuid, user: String },
    #[error("user `{user}` is already a member of {org}")]
    AlreadyMember { org: Uuid, user: String },
    #[error("permission denied: `{user}` lacks {permission:?}")]
    PermissionDenied { user: String, permission: Permission },
    /// La operación dejaría la organización sin administradores.
    #[error("organization {0} must keep at least one admin")]
    LastAdmin(Uuid),
    #[error("invite not found")]
    InviteNotFound,
    #[error("invite expired")]
    InviteExpired,
    #[error("invite already used")]
    InviteUsed,
    #[error("cannot grant role {0:?} through an invite")]
    InvalidInviteRole(Role),
    #[error("privacy job not found: {0}")]
    JobNotFound(Uuid),
    #[error("privacy job {0} already completed")]
    JobCompleted(Uuid),
}
