//! Catálogo de flows versionados.

use chrono::Utc;
use dashmap::DashMap;
use log::info;
use uuid::Uuid;

use crate::engine::plan;
use crate::errors::FlowEngineError;
use crate::model::{Flow, FlowSpec};

/// Persistencia de definiciones de flow. Cada `update_spec` agrega una
/// versión inmutable; `set_active` conmuta el flag del flow completo.
pub trait FlowCatalog: Send + Sync + std::fmt::Debug {
    fn create(&self, name: &str, tenant: &str, panel: &str, spec: FlowSpec) -> Result<Flow, FlowEngineError>;
    fn update_spec(&self, flow_id: Uuid, spec: FlowSpec) -> Result<Flow, FlowEngineError>;
    fn set_active(&self, flow_id: Uuid, active: bool) -> Result<Flow, FlowEngineError>;
    /// Última versión.
    fn get(&self, flow_id: Uuid) -> Result<Flow, FlowEngineError>;
    fn get_version(&self, flow_id: Uuid, version: u32) -> Result<Flow, FlowEngineError>;
    /// Última versión de cada flow, opcionalmente filtrada por tenant.
    fn list(&self, tenant: Option<&str>) -> Result<Vec<Flow>, FlowEngineError>;
}

/// Chequeos comunes a toda implementación antes de guardar una versión.
pub fn validate_definition(name: &str, spec: &FlowSpec) -> Result<(), FlowEngineError> {
    if name.trim().is_empty() {
        return Err(FlowEngineError::InvalidSpec("flow name is required".into()));
    }
    plan(spec)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryFlowCatalog {
    flows: DashMap<Uuid, Vec<Flow>>,
}

impl InMemoryFlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowCatalog for InMemoryFlowCatalog {
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
        self.flows.insert(flow.id, vec![flow.clone()]);
        info!("flow:create id={} name={} tenant={}", flow.id, flow.name, flow.tenant);
        Ok(flow)
    }

    fn update_spec(&self, flow_id: Uuid, spec: FlowSpec) -> Result<Flow, FlowEngineError> {
        plan(&spec)?;
        let mut versions = self.flows.get_mut(&flow_id).ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        let latest = versions.last().cloned().ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        let next = Flow { version: latest.version + 1,
                          spec,
                          updated_at: Utc::now(),
                          ..latest };
        versions.push(next.clone());
        info!("flow:update id={} version={}", flow_id, next.version);
        Ok(next)
    }

    fn set_active(&self, flow_id: Uuid, active: bool) -> Result<Flow, FlowEngineError> {
        let mut versions = self.flows.get_mut(&flow_id).ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        let now = Utc::now();
        for v in versions.iter_mut() {
            v.active = active;
        }
        let latest = versions.last_mut().ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        latest.updated_at = now;
        info!("flow:set_active id={} active={}", flow_id, active);
        Ok(latest.clone())
    }

    fn get(&self, flow_id: Uuid) -> Result<Flow, FlowEngineError> {
        self.flows
            .get(&flow_id)
            .and_then(|v| v.last().cloned())
            .ok_or(FlowEngineError::FlowNotFound(flow_id))
    }

    fn get_version(&self, flow_id: Uuid, version: u32) -> Result<Flow, FlowEngineError> {
        let versions = self.flows.get(&flow_id).ok_or(FlowEngineError::FlowNotFound(flow_id))?;
        versions.iter()
                .find(|f| f.version == version)
                .cloned()
                .ok_or(FlowEngineError::FlowVersionNotFound { flow_id, version })
    }

    fn list(&self, tenant: Option<&str>) -> Result<Vec<Flow>, FlowEngineError> {
        let mut flows: Vec<Flow> = self.flows
                                       .iter()
                                       .filter_map(|e| e.value().last().cloned())
                                       .filter(|f| tenant.map_or(true, |t| f.tenant == t))
                                       .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeSpec;
    use serde_json::json;

    fn spec(agent: &str) -> FlowSpec {
        FlowSpec { nodes: vec![NodeSpec::new("n1", "Action.NHA.Invoke", json!({"agent": agent}))],
                   edges: vec![] }
    }

    #[test]
    fn edits_create_new_versions_and_keep_old_ones() {
        let cat = InMemoryFlowCatalog::new();
        let f = cat.create("triage", "acme", "support", spec("sentiment")).unwrap();
        assert_eq!(f.version, 1);
        assert!(!f.active);
        let f2 = cat.update_spec(f.id, spec("summarize")).unwrap();
        assert_eq!(f2.version, 2);
        assert_eq!(cat.get(f.id).unwrap().version, 2);
        assert_eq!(cat.get_version(f.id, 1).unwrap().spec, spec("sentiment"));
        assert!(matches!(cat.get_version(f.id, 9), Err(FlowEngineError::FlowVersionNotFound { .. })));
    }

    #[test]
    fn activation_is_independent_of_edits() {
        let cat = InMemoryFlowCatalog::new();
        let f = cat.create("triage", "acme", "support", spec("tag")).unwrap();
        cat.set_active(f.id, true).unwrap();
        let f2 = cat.update_spec(f.id, spec("summarize")).unwrap();
        assert!(f2.active);
        assert!(cat.get_version(f.id, 1).unwrap().active);
    }

    #[test]
    fn invalid_specs_are_rejected_on_create() {
        let cat = InMemoryFlowCatalog::new();
        let bad = FlowSpec { nodes: vec![NodeSpec::new("n1", "Nope", json!({}))],
                             edges: vec![] };
        assert!(cat.create("x", "acme", "p", bad).is_err());
        assert!(cat.list(None).unwrap().is_empty());
    }
}
