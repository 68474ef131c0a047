//! Tokenizador de condiciones `if`.

use crate::errors::FlowEngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    /// Path con puntos: `n1.score`, `trigger.post.id`.
    Path(String),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

/// Longitud máxima de una condición, en caracteres.
pub const MAX_CONDITION_LEN: usize = 2048;

pub fn tokenize(src: &str) -> Result<Vec<Token>, FlowEngineError> {
    if src.chars().count() > MAX_CONDITION_LEN {
        return Err(FlowEngineError::Condition(format!("expression longer than {MAX_CONDITION_LEN} characters")));
    }
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: String| FlowEngineError::Condition(msg);

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err(format!("expected `{c}{c}` at {i}")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(err(format!("expected `==` at {i}")));
                }
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                tokens.push(match (c, eq) {
                                ('<', false) => Token::Lt,
                                ('<', true) => Token::Le,
                                ('>', false) => Token::Gt,
                                _ => Token::Ge,
                            });
                i += if eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal".into())),
                        Some('\\') => {
                            if let Some(n) = chars.get(i + 1) {
                                s.push(*n);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let n = lit.parse::<f64>()
                           .map_err(|_| err(format!("invalid number `{lit}`")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                                "and" => Token::And,
                                "or" => Token::Or,
                                "not" => Token::Not,
                                "true" | "True" => Token::Bool(true),
                                "false" | "False" => Token::Bool(false),
                                "null" | "None" => Token::Null,
                                _ => {
                                    if word.ends_with('.') || word.contains("..") {
                                        return Err(err(format!("invalid path `{word}`")));
                                    }
                                    Token::Path(word)
                                }
                            });
            }
            other => return Err(err(format!("unexpected character `{other}` at {i}"))),
        }
    }
    Ok(tokens)
}
