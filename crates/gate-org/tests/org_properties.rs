use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use gate_org::{AuditLog, OrgError, OrgManager, Permission, PrivacyJobStatus, PrivacyJobType, PrivacyJobs, Role};

fn clock() -> (Arc<Mutex<DateTime<Utc>>>, gate_org::NowFn) {
    let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()));
    let c = now.clone();
    (now, Arc::new(move || *c.lock().unwrap()))
}

#[test]
fn creator_is_admin_and_invite_flow_adds_member() {
    let orgs = OrgManager::default();
    let org = orgs.create_org("Acme", "alice").unwrap();
    assert_eq!(orgs.role_of(org.id, "alice"), Some(Role::Admin));

    let inv = orgs.invite(org.id, "alice", "bob@acme.test", Role::Editor).unwrap();
    let bob = orgs.accept_invite(&inv.token, "bob").unwrap();
    assert_eq!(bob.role, Role::Editor);
    assert_eq!(orgs.list_members(org.id, "bob").unwrap().len(), 2);

    assert!(matches!(orgs.accept_invite(&inv.token, "carol"), Err(OrgError::InviteUsed)));
    assert!(matches!(orgs.accept_invite("nope", "carol"), Err(OrgError::InviteNotFound)));
}

#[test]
fn only_admins_invite() {
    let orgs = OrgManager::default();
    let org = orgs.create_org("Acme", "alice").unwrap();
    let inv = orgs.invite(org.id, "alice", "bob@acme.test", Role::Viewer).unwrap();
    orgs.accept_invite(&inv.token, "bob").unwrap();
    let err = orgs.invite(org.id, "bob", "eve@acme.test", Role::Admin).unwrap_err();
    assert!(matches!(err, OrgError::PermissionDenied { permission: Permission::ManageMembers, .. }));
}

#[test]
fn expired_invite_is_rejected() {
    let (now, now_fn) = clock();
    let orgs = OrgManager::new(Duration::hours(24)).with_clock(now_fn);
    let org = orgs.create_org("Acme", "alice").unwrap();
    let inv = orgs.invite(org.id, "alice", "bob@acme.test", Role::Viewer).unwrap();
    *now.lock().unwrap() += Duration::hours(25);
    assert!(matches!(orgs.accept_invite(&inv.token, "bob"), Err(OrgError::InviteExpired)));
    assert_eq!(orgs.role_of(org.id, "bob"), None);
}

#[test]
fn last_admin_cannot_be_demoted_or_removed() {
    let orgs = OrgManager::default();
    let org = orgs.create_org("Acme", "alice").unwrap();
    let inv = orgs.invite(org.id, "alice", "bob@acme.test", Role::Editor).unwrap();
    orgs.accept_invite(&inv.token, "bob").unwrap();
    let before = orgs.list_members(org.id, "alice").unwrap();

    assert!(matches!(orgs.change_role(org.id, "alice", "alice", Role::Viewer), Err(OrgError::LastAdmin(_))));
    assert!(matches!(orgs.remove_member(org.id, "alice", "alice"), Err(OrgError::LastAdmin(_))));
    assert_eq!(orgs.list_members(org.id, "alice").unwrap(), before);

    // con un segundo admin la degradación pasa
    orgs.change_role(org.id, "alice", "bob", Role::Admin).unwrap();
    orgs.change_role(org.id, "bob", "alice", Role::Viewer).unwrap();
    assert_eq!(orgs.role_of(org.id, "alice"), Some(Role::Viewer));
}

#[test]
fn check_permission_follows_matrix() {
    let orgs = OrgManager::default();
    let org = orgs.create_org("Acme", "alice").unwrap();
    let inv = orgs.invite(org.id, "alice", "v@acme.test", Role::Viewer).unwrap();
    orgs.accept_invite(&inv.token, "vic").unwrap();
    assert!(orgs.check_permission("vic", org.id, Permission::ViewFlows).is_ok());
    assert!(orgs.check_permission("vic", org.id, Permission::RunFlows).is_err());
    assert!(orgs.check_permission("stranger", org.id, Permission::ViewFlows).is_err());
    assert!(matches!(orgs.check_permission("alice", uuid::Uuid::new_v4(), Permission::ViewFlows),
                     Err(OrgError::OrgNotFound(_))));
}

#[test]
fn audit_records_membership_changes_and_prunes() {
    let (now, now_fn) = clock();
    let audit = Arc::new(AuditLog::with_clock(now_fn.clone()));
    let orgs = OrgManager::default().with_audit(audit.clone()).with_clock(now_fn);
    let org = orgs.create_org("Acme", "alice").unwrap();
    let inv = orgs.invite(org.id, "alice", "bob@acme.test", Role::Viewer).unwrap();
    orgs.accept_invite(&inv.token, "bob").unwrap();
    orgs.change_role(org.id, "alice", "bob", Role::Editor).unwrap();

    let events = audit.list(10);
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].action, "org.change_role");
    assert_eq!(events[0].before["role"], "viewer");
    assert_eq!(events[0].after["role"], "editor");

    audit.record("ops", "manual", "x", serde_json::Value::Null, serde_json::Value::Null, Some("t-1"));
    assert_eq!(audit.by_trace("t-1").len(), 1);

    *now.lock().unwrap() += Duration::days(91);
    audit.record("ops", "fresh", "y", serde_json::Value::Null, serde_json::Value::Null, None);
    assert_eq!(audit.prune_expired(Duration::days(90)), 5);
    assert_eq!(audit.list(10).len(), 1);
}

#[test]
fn privacy_jobs_advance_to_completion() {
    let (now, now_fn) = clock();
    let base = *now.lock().unwrap();
    let jobs = PrivacyJobs::default().with_clock(now_fn);
    let deadline = |v: &serde_json::Value| v.as_str().unwrap().parse::<DateTime<Utc>>().unwrap();
    let org = uuid::Uuid::new_v4();
    let export = jobs.request_export(org, "bob", "alice").unwrap();
    assert_eq!(export.job_type, PrivacyJobType::Export);
    assert_eq!(deadline(&export.metadata["retention_until"]), base + Duration::days(7));
    let deletion = jobs.request_deletion(org, "bob", "alice").unwrap();
    assert_eq!(deadline(&deletion.metadata["tombstone_until"]), base + Duration::days(30));

    assert_eq!(jobs.advance(export.id).unwrap().status, PrivacyJobStatus::Running);
    assert_eq!(jobs.advance(export.id).unwrap().status, PrivacyJobStatus::Completed);
    assert!(matches!(jobs.advance(export.id), Err(OrgError::JobCompleted(_))));
    assert_eq!(jobs.get(deletion.id).unwrap().status, PrivacyJobStatus::Queued);
    assert!(matches!(jobs.get(uuid::Uuid::new_v4()), Err(OrgError::JobNotFound(_))));
}
