//! Resolución de plantillas `{{path.to.value}}` en parámetros de nodo.
//!
//! - Un string que es exactamente una plantilla se sustituye por el valor
//!   JSON referenciado (conserva números, objetos y arrays).
//! - Plantillas embebidas en texto se renderizan como texto.
//! - Un path que no resuelve deja la plantilla literal.

use serde_json::Value;

use crate::node::OutputMap;

/// Busca `a.b.0.c` en el mapa de outputs. El primer segmento es el id del
/// nodo (o `trigger`); los siguientes navegan objetos o indexan arrays.
pub fn lookup_path<'a>(outputs: &'a OutputMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.trim().split('.');
    let head = segments.next().filter(|s| !s.is_empty())?;
    let mut current = outputs.get(head)?;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Renderiza recursivamente todos los strings de `params`.
pub fn render_params(params: &Value, outputs: &OutputMap) -> Value {
    match params {
        Value::String(s) => render_string(s, outputs),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_params(v, outputs)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), render_params(v, outputs))).collect())
        }
        other => other.clone(),
    }
}

fn render_string(s: &str, outputs: &OutputMap) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return match lookup_path(outputs, path) {
            Some(v) => v.clone(),
            None => Value::String(s.to_string()),
        };
    }
    Value::String(render_text(s, outputs))
}

/// `Some(path)` si `s` es exactamente `{{ path }}`.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

pub fn render_text(s: &str, outputs: &OutputMap) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match lookup_path(outputs, path) {
            Some(Value::String(v)) => out.push_str(v),
            Some(v) => out.push_str(&v.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> OutputMap {
        let mut m = OutputMap::new();
        m.insert("trigger".into(), json!({"text": "great product", "post": {"id": "p1"}}));
        m.insert("n1".into(), json!({"label": "positive", "score": 0.5, "tags": ["a", "b"]}));
        m
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let out = render_params(&json!({"s": "{{n1.score}}", "t": "{{ n1.tags }}"}), &outputs());
        assert_eq!(out, json!({"s": 0.5, "t": ["a", "b"]}));
    }

    #[test]
    fn embedded_placeholders_render_as_text() {
        let out = render_params(&json!("{{trigger.text}} is {{n1.label}} ({{n1.score}})"), &outputs());
        assert_eq!(out, json!("great product is positive (0.5)"));
    }

    #[test]
    fn unresolved_placeholder_stays_literal() {
        let out = render_params(&json!(["{{n9.x}}", "a {{trigger.nope}} b", "{{n1.tags.1}}"]), &outputs());
        assert_eq!(out, json!(["{{n9.x}}", "a {{trigger.nope}} b", "b"]));
    }

    #[test]
    fn unterminated_placeholder_is_copied() {
        assert_eq!(render_text("x {{trigger.text", &outputs()), "x {{trigger.text");
    }
}
