//! Parser descendente recursivo y evaluación.
//!
//! Gramática:
//! ```text
//! or    := and (("||" | "or") and)*
//! and   := unary (("&&" | "and") unary)*
//! unary := ("!" | "not") unary | cmp
//! cmp   := atom (("==" | "!=" | "<" | "<=" | ">" | ">=") atom)?
//! atom  := number | string | bool | null | path | "(" or ")"
//! ```

use std::cmp::Ordering;

use serde_json::Value;

use super::lexer::{tokenize, Token};
use crate::errors::FlowEngineError;
use crate::injection::lookup_path;
use crate::node::OutputMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

/// Anidamiento máximo de `!`/`not` y paréntesis.
pub const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self) -> Result<(), FlowEngineError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FlowEngineError::Condition(format!("expression nested deeper than {MAX_NESTING}")));
        }
        Ok(())
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> Result<Expr, FlowEngineError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, FlowEngineError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FlowEngineError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, FlowEngineError> {
        let lhs = self.atom()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.atom()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn atom(&mut self) -> Result<Expr, FlowEngineError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FlowEngineError::Condition("expected `)`".into())),
                }
            }
            Some(t) => Err(FlowEngineError::Condition(format!("unexpected token {t:?}"))),
            None => Err(FlowEngineError::Condition("unexpected end of expression".into())),
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

pub fn parse(src: &str) -> Result<Expr, FlowEngineError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(FlowEngineError::Condition("empty expression".into()));
    }
    let mut p = Parser { tokens,
                         pos: 0,
                         depth: 0 };
    let expr = p.or()?;
    if p.pos < p.tokens.len() {
        return Err(FlowEngineError::Condition(format!("trailing tokens after position {}", p.pos)));
    }
    Ok(expr)
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

impl Expr {
    pub fn eval(&self, outputs: &OutputMap) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(p) => lookup_path(outputs, p).cloned().unwrap_or(Value::Null),
            Expr::Not(e) => Value::Bool(!truthy(&e.eval(outputs))),
            Expr::And(l, r) => Value::Bool(truthy(&l.eval(outputs)) && truthy(&r.eval(outputs))),
            Expr::Or(l, r) => Value::Bool(truthy(&l.eval(outputs)) || truthy(&r.eval(outputs))),
            Expr::Cmp(op, l, r) => {
                let (a, b) = (l.eval(outputs), r.eval(outputs));
                let ord = compare(&a, &b);
                let res = match op {
                    CmpOp::Eq => ord == Some(Ordering::Equal),
                    CmpOp::Ne => ord != Some(Ordering::Equal),
                    CmpOp::Lt => ord == Some(Ordering::Less),
                    CmpOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                    CmpOp::Gt => ord == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                };
                Value::Bool(res)
            }
        }
    }
}

/// Parsea y evalúa `src` como booleano.
pub fn evaluate(src: &str, outputs: &OutputMap) -> Result<bool, FlowEngineError> {
    Ok(truthy(&parse(src)?.eval(outputs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> OutputMap {
        let mut m = OutputMap::new();
        m.insert("trigger".into(), json!({"text": "hi", "lang": "es"}));
        m.insert("n1".into(), json!({"label": "positive", "score": 0.5}));
        m
    }

    #[test]
    fn deep_nesting_is_rejected_without_recursing() {
        let nots = format!("{}true", "!".repeat(MAX_NESTING + 1));
        assert!(matches!(parse(&nots), Err(FlowEngineError::Condition(_))));
        let parens = format!("{}true{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert!(matches!(parse(&parens), Err(FlowEngineError::Condition(_))));

        let ok = format!("{}true{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse(&ok).is_ok());
        assert!(parse(&format!("{}true", "!".repeat(MAX_NESTING))).is_ok());
    }

    #[test]
    fn oversized_expression_is_rejected() {
        let huge = format!("{}true", "!".repeat(2_000_000));
        let err = parse(&huge).unwrap_err();
        assert!(err.to_string().contains("longer than"), "{err}");
    }

    #[test]
    fn numeric_comparisons() {
        let o = outputs();
        assert!(!evaluate("n1.score > 0.9", &o).unwrap());
        assert!(evaluate("n1.score >= 0.5", &o).unwrap());
        assert!(evaluate("n1.score == 0.5", &o).unwrap());
    }

    #[test]
    fn boolean_operators_and_precedence() {
        let o = outputs();
        assert!(evaluate("n1.label == 'positive' and trigger.lang != \"en\"", &o).unwrap());
        assert!(evaluate("false || n1.score < 1 && !false", &o).unwrap());
        assert!(!evaluate("not (n1.score < 1)", &o).unwrap());
    }

    #[test]
    fn missing_path_is_null_and_falsy() {
        let o = outputs();
        assert!(!evaluate("n2.score", &o).unwrap());
        assert!(evaluate("n2.score == null", &o).unwrap());
        assert!(!evaluate("n2.score > 0", &o).unwrap());
    }

    #[test]
    fn malformed_expressions_are_errors() {
        assert!(parse("n1.score >").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("").is_err());
        assert!(parse("__import__('os')").is_err());
    }
}
