//! Trabajos de privacidad: exportación y borrado de datos de un usuario.
//!
//! Ciclo de vida `queued → running → completed`. La exportación guarda en su
//! metadata hasta cuándo se retiene el archivo; el borrado, hasta cuándo se
//! conserva el tombstone.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{AuditLog, NowFn};
use crate::error::OrgError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyJobType {
    Export,
    Deletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyJobStatus {
    Queued,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyJob {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: PrivacyJobType,
    pub org_id: Uuid,
    pub subject: String,
    pub requested_by: String,
    pub status: PrivacyJobStatus,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    pub export_retention_days: i64,
    pub tombstone_days: i64,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self { export_retention_days: 7,
               tombstone_days: 30 }
    }
}

pub struct PrivacyJobs {
    jobs: DashMap<Uuid, PrivacyJob>,
    policy: PrivacyPolicy,
    audit: Option<Arc<AuditLog>>,
    now: NowFn,
}

impl std::fmt::Debug for PrivacyJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyJobs")
         .field("jobs", &self.jobs.len())
         .field("policy", &self.policy)
         .finish()
    }
}

impl Default for PrivacyJobs {
    fn default() -> Self {
        Self::new(PrivacyPolicy::default())
    }
}

impl PrivacyJobs {
    pub fn new(policy: PrivacyPolicy) -> Self {
        Self { jobs: DashMap::new(),
               policy,
               audit: None,
               now: Arc::new(Utc::now) }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    fn create(&self,
              job_type: PrivacyJobType,
              org_id: Uuid,
              subject: &str,
              requested_by: &str,
              metadata: Value)
              -> Result<PrivacyJob, OrgError> {
        if subject.trim().is_empty() {
            return Err(OrgError::Validation("subject is required".into()));
        }
        let now = (self.now)();
        let job = PrivacyJob { id: Uuid::new_v4(),
                               job_type,
                               org_id,
                               subject: subject.to_string(),
                               requested_by: requested_by.to_string(),
                               status: PrivacyJobStatus::Queued,
                               metadata,
                               created_at: now,
                               updated_at: now };
        self.jobs.insert(job.id, job.clone());
        info!("privacy:request job={} type={job_type:?} org={org_id}", job.id);
        if let Some(audit) = self.audit.as_ref() {
            audit.record(requested_by,
                         "privacy.request",
                         &job.id.to_string(),
                         Value::Null,
                         json!({ "type": job_type, "subject": subject }),
                         None);
        }
        Ok(job)
    }

    pub fn request_export(&self, org_id: Uuid, subject: &str, requested_by: &str) -> Result<PrivacyJob, OrgError> {
        let until = (self.now)() + Duration::days(self.policy.export_retention_days);
        self.create(PrivacyJobType::Export,
                    org_id,
                    subject,
                    requested_by,
                    json!({ "retention_until": until }))
    }

    pub fn request_deletion(&self, org_id: Uuid, subject: &str, requested_by: &str) -> Result<PrivacyJob, OrgError> {
        let until = (self.now)() + Duration::days(self.policy.tombstone_days);
        self.create(PrivacyJobType::Deletion,
                    org_id,
                    subject,
                    requested_by,
                    json!({ "tombstone_until": until }))
    }

    /// Avanza un paso. Un job completado no se mueve.
    pub fn advance(&self, id: Uuid) -> Result<PrivacyJob, OrgError> {
        let mut job = self.jobs.get_mut(&id).ok_or(OrgError::JobNotFound(id))?;
        job.status = match job.status {
            PrivacyJobStatus::Queued => PrivacyJobStatus::Running,
            PrivacyJobStatus::Running => PrivacyJobStatus::Completed,
            PrivacyJobStatus::Completed => return Err(OrgError::JobCompleted(id)),
        };
        job.updated_at = (self.now)();
        info!("privacy:advance job={id} status={:?}", job.status);
        Ok(job.clone())
    }

    pub fn get(&self, id: Uuid) -> Result<PrivacyJob, OrgError> {
        self.jobs.get(&id).map(|j| j.clone()).ok_or(OrgError::JobNotFound(id))
    }
}
