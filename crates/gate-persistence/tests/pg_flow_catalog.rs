mod test_support;

use gate_core::{FlowCatalog, FlowEngineError, FlowSpec};
use gate_persistence::{PgFlowCatalog, PoolProvider};
use serde_json::json;
use test_support::{unique, with_pool};

fn spec(agent: &str) -> FlowSpec {
    serde_json::from_value(json!({
        "nodes": [
            { "id": "score", "type": "Action.NHA.Invoke", "params": { "agent": agent, "text": "{{trigger.text}}" } },
            { "id": "out", "type": "Util.Emit", "params": {} }
        ],
        "edges": [ { "from": "score", "to": "out" } ]
    })).unwrap()
}

#[test]
fn versions_accumulate_and_activation_covers_all() {
    with_pool(|pool| {
        let catalog = PgFlowCatalog::new(PoolProvider::new(pool.clone()));
        let tenant = unique("tenant");
        let flow = catalog.create("triage", &tenant, "support", spec("sentiment")).unwrap();
        assert_eq!(flow.version, 1);
        assert!(!flow.active);

        let v2 = catalog.update_spec(flow.id, spec("tagger")).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.created_at, flow.created_at);

        let active = catalog.set_active(flow.id, true).unwrap();
        assert!(active.active);
        assert_eq!(active.version, 2);
        assert!(catalog.get_version(flow.id, 1).unwrap().active);
        assert_eq!(catalog.get_version(flow.id, 1).unwrap().spec, spec("sentiment"));

        let listed = catalog.list(Some(&tenant)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, 2);
    });
}

#[test]
fn missing_flows_and_versions_are_reported() {
    with_pool(|pool| {
        let catalog = PgFlowCatalog::new(PoolProvider::new(pool.clone()));
        let ghost = uuid::Uuid::new_v4();
        assert!(matches!(catalog.get(ghost), Err(FlowEngineError::FlowNotFound(_))));
        assert!(matches!(catalog.set_active(ghost, true), Err(FlowEngineError::FlowNotFound(_))));

        let flow = catalog.create("triage", &unique("tenant"), "", spec("sentiment")).unwrap();
        assert!(matches!(catalog.get_version(flow.id, 9),
                         Err(FlowEngineError::FlowVersionNotFound { version: 9, .. })));
        assert!(matches!(catalog.create(" ", "t", "", spec("sentiment")), Err(FlowEngineError::InvalidSpec(_))));
    });
}

#[test]
fn two_catalogs_over_one_database_see_the_same_flows() {
    with_pool(|pool| {
        let a = PgFlowCatalog::new(PoolProvider::new(pool.clone()));
        let b = PgFlowCatalog::new(PoolProvider::new(pool.clone()));
        let flow = a.create("shared", &unique("tenant"), "", spec("sentiment")).unwrap();
        a.set_active(flow.id, true).unwrap();
        let seen = b.get(flow.id).unwrap();
        assert!(seen.active);
        assert_eq!(seen.name, "shared");
    });
}
