//! `FlowCatalog` sobre la tabla `flows`: una fila por versión.
//!
//! `update_spec` inserta `max(version) + 1`; dos ediciones concurrentes
//! chocan en la PK `(id, version)` y la perdedora se reporta como error de
//! store. `set_active` actualiza todas las versiones del flow.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use gate_core::{validate_definition, Flow, FlowCatalog, FlowEngineError, FlowSpec};
use log::info;
use serde_json::Value;
use uuid::Uuid;

use super::{with_retry, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::flows;

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = flows)]
struct FlowRow {
    id: Uuid,
    version: i32,
    name: String,
    tenant: String,
    panel: String,
    spec: Value,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FlowRow {
    fn from_flow(flow: &Flow) -> Result<Self, FlowEngineError> {
        let spec = serde_json::to_value(&flow.spec).map_err(|e| FlowEngineError::Internal(format!("serialize spec: {e}")))?;
        let version = i32::try_from(flow.version).map_err(|_| {
                                                     FlowEngineError::InvalidSpec(format!("version {} out of range",
                                                                                          flow.version))
                                                 })?;
        Ok(Self { id: flow.id,
                  version,
                  name: flow.name.clone(),
                  tenant: flow.tenant.clone(),
                  panel: flow.panel.clone(),
                  spec,
                  active: flow.active,
                  created_at: flow.created_at,
                  updated_at: flow.updated_at })
    }
}

impl TryFrom<FlowRow> for Flow {
    type Error = PersistenceError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        let spec: FlowSpec = serde_json::from_value(row.spec).map_err(|e| {
                                                                PersistenceError::Corrupt(format!("flow={} version={} {e}",
                                                                                                  row.id, row.version))
                                                            })?;
        Ok(Flow { id: row.id,
                  name: row.name,
                  tenant: row.tenant,
                  panel: row.panel,
                  version: row.version.max(0) as u32,
                  spec,
                  active: row.active,
                  created_at: row.created_at,
                  updated_at: row.updated_at })
    }
}

pub struct PgFlowCatalog<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> std::fmt::Debug for PgFlowCatalog<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgFlowCatalog").finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> PgFlowCatalog<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    fn insert(&self, flow: &Flow) -> Result<(), FlowEngineError> {
        let row = FlowRow::from_flow(flow)?;
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(flows::table).values(&row)
                                             .execute(&mut conn)
                                             .map_err(PersistenceError::from)
        })?;
        Ok(())
    }

    fn latest(&self, flow_id: Uuid) -> Result<Option<Flow>, FlowEngineError> {
        let row: Option<FlowRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            flows::table.filter(flows::id.eq(flow_id))
                        .order(flows::version.desc())
                        .first(&mut conn)
                        .optional()
                        .map_err(PersistenceError::from)
        })?;
        Ok(row.map(Flow::try_from).transpose()?)
    }
}

impl<P: ConnectionProvider> FlowCatalog for PgFlowCatalog<P> {
    fn create(&self, name: &str, tenant: &str, panel: &str, spec: FlowSpec) -> Result<Flow, FlowEngineError> {
        validate_definition(name, &spec)?;
        let now = Utc::now();
        let flow = Flow { id: Uuid::new_v4(),
                          name: name.to_string(),
                          tenant: tenant.to_string(),
                          panel: panel.to_string(),
                          version: 1,
                          spec,
                          active: false,
                          created_at: now,
                          updated_at: now };
        self.insert(&flow)?;
        info!("flow:create id={} name={} tenant={}", flow.id, flow.name, flow.tenant);
        Ok(flow)
    }

    fn update_spec(&self, flow_id: Uuid, spec: FlowSpec) -> Result<Flow, FlowEngineError> {
        gate_core::plan(&spec)?;
        let latest = self.latest(flow_id)?.ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        let next = Flow { version: latest.version + 1,
                          spec,
                          updated_at: Utc::now(),
                          ..latest };
        self.insert(&next)?;
        info!("flow:update id={} version={}", flow_id, next.version);
        Ok(next)
    }

    fn set_active(&self, flow_id: Uuid, active: bool) -> Result<Flow, FlowEngineError> {
        let now = Utc::now();
        let touched = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(flows::table.filter(flows::id.eq(flow_id))).set((flows::active.eq(active),
                                                                            flows::updated_at.eq(now)))
                                                                       .execute(&mut conn)
                                                                       .map_err(PersistenceError::from)
        })?;
        if touched == 0 {
            return Err(FlowEngineError::FlowNotFound(flow_id));
        }
        info!("flow:set_active id={} active={}", flow_id, active);
        self.get(flow_id)
    }

    fn get(&self, flow_id: Uuid) -> Result<Flow, FlowEngineError> {
        self.latest(flow_id)?.ok_or(FlowEngineError::FlowNotFound(flow_id))
    }

    fn get_version(&self, flow_id: Uuid, version: u32) -> Result<Flow, FlowEngineError> {
        let Ok(v) = i32::try_from(version) else {
            return Err(FlowEngineError::FlowVersionNotFound { flow_id, version });
        };
        let row: Option<FlowRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            flows::table.find((flow_id, v))
                        .first(&mut conn)
                        .optional()
                        .map_err(PersistenceError::from)
        })?;
        match row {
            Some(row) => Ok(Flow::try_from(row)?),
            None if self.latest(flow_id)?.is_none() => Err(FlowEngineError::FlowNotFound(flow_id)),
            None => Err(FlowEngineError::FlowVersionNotFound { flow_id, version }),
        }
    }

    fn list(&self, tenant: Option<&str>) -> Result<Vec<Flow>, FlowEngineError> {
        let rows: Vec<FlowRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            let latest = flows::table.distinct_on(flows::id).order((flows::id, flows::version.desc()));
            match tenant {
                Some(t) => latest.filter(flows::tenant.eq(t)).load(&mut conn),
                None => latest.load(&mut conn),
            }.map_err(PersistenceError::from)
        })?;
        let mut out = rows.into_iter().map(Flow::try_from).collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
