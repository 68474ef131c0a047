//! gate-org: organizaciones con RBAC, log de auditoría y trabajos de
//! privacidad (exportación / borrado).
pub mod audit;
pub mod error;
pub mod orgs;
pub mod privacy;
pub mod rbac;

pub use audit::{AuditEvent, AuditLog, NowFn};
pub use error::OrgError;
pub use orgs::{OrgInvite, OrgManager, OrgUser, Organization};
pub use privacy::{PrivacyJob, PrivacyJobStatus, PrivacyJobType, PrivacyJobs, PrivacyPolicy};
pub use rbac::{Permission, Role};
