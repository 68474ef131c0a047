//! Validación del spec y orden de ejecución.
//!
//! El orden se obtiene con un DFS sobre la adyacencia inversa
//! (nodo -> dependencias): cada nodo se emite después de todas sus
//! dependencias (post-orden). Las raíces se visitan en orden de declaración,
//! de modo que el orden es determinista para un mismo spec.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::condition;
use crate::errors::FlowEngineError;
use crate::model::FlowSpec;
use crate::node::NodeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.deps.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Todos los nodos alcanzables desde `node_id` siguiendo aristas, sin
    /// incluirlo.
    pub fn transitive_dependents(&self, node_id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
        let mut out = Vec::new();
        while let Some(cur) = queue.pop_front() {
            for next in self.dependents.get(cur).into_iter().flatten() {
                if next != node_id && seen.insert(next.as_str()) {
                    out.push(next.clone());
                    queue.push_back(next.as_str());
                }
            }
        }
        out
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Valida `spec` y calcula el orden de ejecución.
///
/// Errores: ids vacíos o duplicados, aristas hacia nodos inexistentes,
/// tipos desconocidos, condiciones `if` que no parsean y ciclos.
pub fn plan(spec: &FlowSpec) -> Result<ExecutionPlan, FlowEngineError> {
    if spec.nodes.is_empty() {
        return Err(FlowEngineError::InvalidSpec("flow has no nodes".into()));
    }
    let mut ids: HashSet<&str> = HashSet::new();
    for node in &spec.nodes {
        if node.id.trim().is_empty() {
            return Err(FlowEngineError::InvalidSpec("node with empty id".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(FlowEngineError::InvalidSpec(format!("duplicate node id `{}`", node.id)));
        }
        if NodeKind::parse(&node.node_type).is_none() {
            return Err(FlowEngineError::UnknownNodeType(node.node_type.clone()));
        }
        if let Some(cond) = &node.condition {
            condition::parse(cond).map_err(|e| {
                                      FlowEngineError::Condition(format!("node `{}`: {e}", node.id))
                                  })?;
        }
    }

    let mut deps: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &spec.edges {
        for end in [&edge.from, &edge.to] {
            if !ids.contains(end.as_str()) {
                return Err(FlowEngineError::InvalidSpec(format!("edge references unknown node `{end}`")));
            }
        }
        if edge.from == edge.to {
            return Err(FlowEngineError::CycleDetected(edge.from.clone()));
        }
        let d = deps.entry(edge.to.clone()).or_default();
        if !d.contains(&edge.from) {
            d.push(edge.from.clone());
            dependents.entry(edge.from.clone()).or_default().push(edge.to.clone());
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        visit(&node.id, &deps, &mut marks, &mut order)?;
    }
    Ok(ExecutionPlan { order, deps, dependents })
}

fn visit<'a>(id: &'a str,
             deps: &'a HashMap<String, Vec<String>>,
             marks: &mut HashMap<&'a str, Mark>,
             order: &mut Vec<String>)
             -> Result<(), FlowEngineError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => return Err(FlowEngineError::CycleDetected(id.to_string())),
        None => {}
    }
    marks.insert(id, Mark::Visiting);
    for dep in deps.get(id).into_iter().flatten() {
        visit(dep, deps, marks, order)?;
    }
    marks.insert(id, Mark::Done);
    order.push(id.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeSpec, NodeSpec};
    use serde_json::json;

    fn node(id: &str) -> NodeSpec {
        NodeSpec::new(id, "Transform.Map", json!({}))
    }

    #[test]
    fn order_respects_dependencies() {
        let spec = FlowSpec { nodes: vec![node("c"), node("b"), node("a")],
                              edges: vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "c")] };
        let p = plan(&spec).unwrap();
        assert_eq!(p.order, vec!["a", "b", "c"]);
        assert_eq!(p.dependencies("c"), &["b".to_string()]);
    }

    #[test]
    fn detects_cycles() {
        let spec = FlowSpec { nodes: vec![node("a"), node("b")],
                              edges: vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "a")] };
        assert!(matches!(plan(&spec), Err(FlowEngineError::CycleDetected(_))));
    }

    #[test]
    fn rejects_unknown_edges_and_types() {
        let spec = FlowSpec { nodes: vec![node("a")],
                              edges: vec![EdgeSpec::new("a", "zzz")] };
        assert!(matches!(plan(&spec), Err(FlowEngineError::InvalidSpec(_))));
        let spec = FlowSpec { nodes: vec![NodeSpec::new("a", "Action.Shell", json!({}))],
                              edges: vec![] };
        assert_eq!(plan(&spec), Err(FlowEngineError::UnknownNodeType("Action.Shell".into())));
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_conditions() {
        let spec = FlowSpec { nodes: vec![node("a"), node("a")],
                              edges: vec![] };
        assert!(matches!(plan(&spec), Err(FlowEngineError::InvalidSpec(_))));
        let spec = FlowSpec { nodes: vec![node("a").with_condition("a >")],
                              edges: vec![] };
        assert!(matches!(plan(&spec), Err(FlowEngineError::Condition(_))));
    }

    #[test]
    fn transitive_dependents_follow_all_paths() {
        let spec = FlowSpec { nodes: vec![node("f"), node("x"), node("y"), node("z"), node("other")],
                              edges: vec![EdgeSpec::new("f", "x"),
                                          EdgeSpec::new("x", "y"),
                                          EdgeSpec::new("f", "z"),
                                          EdgeSpec::new("y", "z")] };
        let p = plan(&spec).unwrap();
        let mut d = p.transitive_dependents("f");
        d.sort();
        assert_eq!(d, vec!["x", "y", "z"]);
    }
}
