//! Organizaciones, miembros e invitaciones.
//!
//! Toda la membresía vive detrás de un único `RwLock`: las comprobaciones de
//! "último admin" y la mutación ocurren bajo el mismo write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditLog, NowFn};
use crate::error::OrgError;
use crate::rbac::{Permission, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUser {
    pub org_id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgInvite {
    pub token: String,
    pub org_id: Uuid,
    pub email: String,
    pub role: Role,
    pub invited_by: String,
    pub expires_at: DateTime<Utc>,
    pub accepted_by: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct OrgState {
    orgs: HashMap<Uuid, Organization>,
    members: HashMap<Uuid, BTreeMap<String, OrgUser>>,
    invites: HashMap<String, OrgInvite>,
}

pub struct OrgManager {
    state: RwLock<OrgState>,
    audit: Option<Arc<AuditLog>>,
    invite_ttl: Duration,
    now: NowFn,
}

impl std::fmt::Debug for OrgManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgManager")
         .field("invite_ttl", &self.invite_ttl)
         .finish_non_exhaustive()
    }
}

impl Default for OrgManager {
    fn default() -> Self {
        Self::new(Duration::days(7))
    }
}

fn count_admins(members: &BTreeMap<String, OrgUser>) -> usize {
    members.values().filter(|m| m.role == Role::Admin).count()
}

impl OrgManager {
    pub fn new(invite_ttl: Duration) -> Self {
        Self { state: RwLock::new(OrgState::default()),
               audit: None,
               invite_ttl,
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

    fn read(&self) -> RwLockReadGuard<'_, OrgState> {
        self.state.read().unwrap_or_else(|e| {
                              warn!("org: lock poisoned on read, recovering");
                              e.into_inner()
                          })
    }

    fn write(&self) -> RwLockWriteGuard<'_, OrgState> {
        self.state.write().unwrap_or_else(|e| {
                               warn!("org: lock poisoned on write, recovering");
                               e.into_inner()
                           })
    }

    fn audit(&self, actor: &str, action: &str, target: &str, before: serde_json::Value, after: serde_json::Value) {
        if let Some(audit) = self.audit.as_ref() {
            audit.record(actor, action, target, before, after, None);
        }
    }

    fn require(state: &OrgState, org_id: Uuid, user: &str, permission: Permission) -> Result<(), OrgError> {
        let members = state.members.get(&org_id).ok_or(OrgError::OrgNotFound(org_id))?;
        match members.get(user) {
            Some(m) if m.role.allows(permission) => Ok(()),
            _ => Err(OrgError::PermissionDenied { user: user.to_string(),
                                                  permission }),
        }
    }

    /// Crea la organización; el creador queda como admin.
    pub fn create_org(&self, name: &str, creator: &str) -> Result<Organization, OrgError> {
        if name.trim().is_empty() || creator.trim().is_empty() {
            return Err(OrgError::Validation("name and creator are required".into()));
        }
        let now = (self.now)();
        let org = Organization { id: Uuid::new_v4(),
                                 name: name.trim().to_string(),
                                 created_by: creator.to_string(),
                                 created_at: now };
        let admin = OrgUser { org_id: org.id,
                              user_id: creator.to_string(),
                              role: Role::Admin,
                              joined_at: now };
        {
            let mut state = self.write();
            state.orgs.insert(org.id, org.clone());
            state.members
                 .entry(org.id)
                 .or_default()
                 .insert(creator.to_string(), admin);
        }
        info!("org:create org={} creator={creator}", org.id);
        self.audit(creator, "org.create", &org.id.to_string(), json!(null), json!({ "name": org.name }));
        Ok(org)
    }

    pub fn get_org(&self, org_id: Uuid) -> Result<Organization, OrgError> {
        self.read().orgs.get(&org_id).cloned().ok_or(OrgError::OrgNotFound(org_id))
    }

    /// Sólo admins. Devuelve la invitación con su token.
    pub fn invite(&self, org_id: Uuid, actor: &str, email: &str, role: Role) -> Result<OrgInvite, OrgError> {
        if !email.contains('@') {
            return Err(OrgError::Validation(format!("invalid email `{email}`")));
        }
        let invite = {
            let mut state = self.write();
            Self::require(&state, org_id, actor, Permission::ManageMembers)?;
            let invite = OrgInvite { token: Uuid::new_v4().simple().to_string(),
                                     org_id,
                                     email: email.to_string(),
                                     role,
                                     invited_by: actor.to_string(),
                                     expires_at: (self.now)() + self.invite_ttl,
                                     accepted_by: None,
                                     accepted_at: None };
            state.invites.insert(invite.token.clone(), invite.clone());
            invite
        };
        info!("org:invite org={org_id} role={} by={actor}", role.as_str());
        self.audit(actor,
                   "org.invite",
                   &org_id.to_string(),
                   json!(null),
                   json!({ "email": email, "role": role }));
        Ok(invite)
    }

    /// Rechaza tokens desconocidos, vencidos o ya usados.
    pub fn accept_invite(&self, token: &str, user: &str) -> Result<OrgUser, OrgError> {
        let now = (self.now)();
        let member = {
            let mut state = self.write();
            let invite = state.invites.get(token).cloned().ok_or(OrgError::InviteNotFound)?;
            if invite.accepted_at.is_some() {
                return Err(OrgError::InviteUsed);
            }
            if now >= invite.expires_at {
                return Err(OrgError::InviteExpired);
            }
            let members = state.members.entry(invite.org_id).or_default();
            if members.contains_key(user) {
                return Err(OrgError::AlreadyMember { org: invite.org_id,
                                                     user: user.to_string() });
            }
            let member = OrgUser { org_id: invite.org_id,
                                   user_id: user.to_string(),
                                   role: invite.role,
                                   joined_at: now };
            members.insert(user.to_string(), member.clone());
            if let Some(inv) = state.invites.get_mut(token) {
                inv.accepted_by = Some(user.to_string());
                inv.accepted_at = Some(now);
            }
            member
        };
        info!("org:accept org={} user={user}", member.org_id);
        self.audit(user,
                   "org.accept_invite",
                   &member.org_id.to_string(),
                   json!(null),
                   json!({ "role": member.role }));
        Ok(member)
    }

    pub fn list_members(&self, org_id: Uuid, actor: &str) -> Result<Vec<OrgUser>, OrgError> {
        let state = self.read();
        let members = state.members.get(&org_id).ok_or(OrgError::OrgNotFound(org_id))?;
        if !members.contains_key(actor) {
            return Err(OrgError::NotMember { org: org_id,
                                             user: actor.to_string() });
        }
        Ok(members.values().cloned().collect())
    }

    pub fn change_role(&self, org_id: Uuid, actor: &str, user: &str, role: Role) -> Result<OrgUser, OrgError> {
        let (before, after) = {
            let mut state = self.write();
            Self::require(&state, org_id, actor, Permission::ManageMembers)?;
            let members = state.members.get_mut(&org_id).ok_or(OrgError::OrgNotFound(org_id))?;
            let current = members.get(user).cloned().ok_or_else(|| OrgError::NotMember { org: org_id,
                                                                                         user: user.to_string() })?;
            if current.role == Role::Admin && role != Role::Admin && count_admins(members) <= 1 {
                warn!("org:change_role rejected org={org_id} user={user} reason=last_admin");
                return Err(OrgError::LastAdmin(org_id));
            }
            let mut updated = current.clone();
            updated.role = role;
            members.insert(user.to_string(), updated.clone());
            (current, updated)
        };
        self.audit(actor,
                   "org.change_role",
                   &format!("{org_id}/{user}"),
                   json!({ "role": before.role }),
                   json!({ "role": after.role }));
        Ok(after)
    }

    pub fn remove_member(&self, org_id: Uuid, actor: &str, user: &str) -> Result<OrgUser, OrgError> {
        let removed = {
            let mut state = self.write();
            // un miembro puede salir por sí mismo; quitar a otro exige permiso
            if actor != user {
                Self::require(&state, org_id, actor, Permission::ManageMembers)?;
            }
            let members = state.members.get_mut(&org_id).ok_or(OrgError::OrgNotFound(org_id))?;
            let current = members.get(user).cloned().ok_or_else(|| OrgError::NotMember { org: org_id,
                                                                                         user: user.to_string() })?;
            if current.role == Role::Admin && count_admins(members) <= 1 {
                warn!("org:remove rejected org={org_id} user={user} reason=last_admin");
                return Err(OrgError::LastAdmin(org_id));
            }
            members.remove(user);
            current
        };
        self.audit(actor,
                   "org.remove_member",
                   &format!("{org_id}/{user}"),
                   json!({ "role": removed.role }),
                   json!(null));
        Ok(removed)
    }

    pub fn role_of(&self, org_id: Uuid, user: &str) -> Option<Role> {
        self.read().members.get(&org_id).and_then(|m| m.get(user)).map(|m| m.role)
    }

    pub fn check_permission(&self, user: &str, org_id: Uuid, permission: Permission) -> Result<(), OrgError> {
        Self::require(&self.read(), org_id, user, permission)
    }
}
