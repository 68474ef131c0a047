//! Conjunto cerrado de tipos de nodo.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Trigger,
    NhaInvoke,
    RagQuery,
    CommentPost,
    Filter,
    Map,
    Delay,
    Emit,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [NodeKind::Trigger,
                                    NodeKind::NhaInvoke,
                                    NodeKind::RagQuery,
                                    NodeKind::CommentPost,
                                    NodeKind::Filter,
                                    NodeKind::Map,
                                    NodeKind::Delay,
                                    NodeKind::Emit];

    /// Resuelve el `type` de un nodo. Cualquier `Trigger.*` es un trigger.
    pub fn parse(type_name: &str) -> Option<Self> {
        if type_name == "Trigger" || type_name.starts_with("Trigger.") {
            return Some(NodeKind::Trigger);
        }
        match type_name {
            "Action.NHA.Invoke" => Some(NodeKind::NhaInvoke),
            "Action.RAG.Query" => Some(NodeKind::RagQuery),
            "Action.Comment.Post" => Some(NodeKind::CommentPost),
            "Logic.Filter" => Some(NodeKind::Filter),
            "Transform.Map" => Some(NodeKind::Map),
            "Util.Delay" => Some(NodeKind::Delay),
            "Util.Emit" => Some(NodeKind::Emit),
            _ => None,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            NodeKind::Trigger => "Trigger",
            NodeKind::NhaInvoke => "Action.NHA.Invoke",
            NodeKind::RagQuery => "Action.RAG.Query",
            NodeKind::CommentPost => "Action.Comment.Post",
            NodeKind::Filter => "Logic.Filter",
            NodeKind::Map => "Transform.Map",
            NodeKind::Delay => "Util.Delay",
            NodeKind::Emit => "Util.Emit",
        }
    }
}
