// SPDX-License-Identifier: MIT OR Apache-2.0
//! Predicate expressions over node result documents.
//!
//! Branch rules and loop continuation conditions are small boolean
//! expressions evaluated against the completing node's result JSON:
//!
//! ```
//! use serde_json::json;
//!
//! let doc = json!({"score": 85, "status": "ok"});
//! assert!(wfk_expr::evaluate_str("output.score >= 80", &doc).unwrap());
//! assert!(wfk_expr::evaluate_str("output.status != 'error' && output.score < 100", &doc).unwrap());
//! ```
//!
//! Grammar (informal): comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`)
//! between field paths and literals, composed with `&&`, `||`, `!`, and
//! parentheses. The leading `output` segment addresses the result document
//! root; a bare field name does the same. Missing paths resolve to `null`.
//! Input is untrusted: size and nesting limits are enforced.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::Value;
use std::fmt;

/// Maximum allowed expression size in bytes.
const MAX_INPUT_BYTES: usize = 64 * 1024;
/// Maximum supported nesting depth.
const MAX_NESTING: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    /// Input was empty or whitespace-only.
    #[error("expression is empty")]
    EmptyInput,

    /// Input exceeded the size limit.
    #[error("expression too large: {actual_bytes} bytes (max {max_bytes})")]
    InputTooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual input length.
        actual_bytes: usize,
    },

    /// Nesting exceeded the depth limit.
    #[error("expression nests deeper than {max_depth} levels")]
    NestingTooDeep {
        /// Maximum allowed depth.
        max_depth: usize,
    },

    /// Unexpected token during parsing.
    #[error("expected {expected} at byte {position}, found `{found}`")]
    UnexpectedToken {
        /// What the parser expected.
        expected: &'static str,
        /// The offending token text.
        found: String,
        /// Byte offset in the input.
        position: usize,
    },

    /// Input ended mid-expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// A value of the wrong type reached an operator.
    #[error("cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        /// Operator text.
        op: String,
        /// JSON type name of the left operand.
        left: &'static str,
        /// JSON type name of the right operand.
        right: &'static str,
    },

    /// A non-boolean value was used in boolean position.
    #[error("expected a boolean, got {found}")]
    NotABoolean {
        /// JSON type name of the offending value.
        found: &'static str,
    },
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A JSON literal (number, string, bool, null).
    Literal(Value),
    /// A dotted field path into the result document.
    Path(Vec<String>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// A comparison.
    Compare {
        /// The operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse an expression.
///
/// # Errors
///
/// Returns [`ExprError`] on empty/oversized input or malformed syntax.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    if input.trim().is_empty() {
        return Err(ExprError::EmptyInput);
    }
    if input.len() > MAX_INPUT_BYTES {
        return Err(ExprError::InputTooLarge {
            max_bytes: MAX_INPUT_BYTES,
            actual_bytes: input.len(),
        });
    }
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.parse_or(0)?;
    if let Some(tok) = parser.peek() {
        return Err(ExprError::UnexpectedToken {
            expected: "end of expression",
            found: tok.text.clone(),
            position: tok.position,
        });
    }
    Ok(expr)
}

/// Evaluate a parsed expression against a result document.
///
/// # Errors
///
/// Returns [`ExprError::TypeMismatch`] or [`ExprError::NotABoolean`] when
/// the document's types do not fit the expression.
pub fn evaluate(expr: &Expr, document: &Value) -> Result<bool, ExprError> {
    as_bool(&eval_value(expr, document)?)
}

/// Parse and evaluate in one step.
///
/// # Errors
///
/// Any parse or evaluation error from [`parse`] and [`evaluate`].
pub fn evaluate_str(input: &str, document: &Value) -> Result<bool, ExprError> {
    evaluate(&parse(input)?, document)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident,
    Number,
    Str,
    Op,
    LParen,
    RParen,
    Dot,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, text: "(".into(), position: i });
                i += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, text: ")".into(), position: i });
                i += 1;
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, text: ".".into(), position: i });
                i += 1;
            }
            b'&' | b'|' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b {
                    let text = if b == b'&' { "&&" } else { "||" };
                    tokens.push(Token { kind: TokenKind::Op, text: text.into(), position: i });
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedToken {
                        expected: "`&&` or `||`",
                        found: (b as char).to_string(),
                        position: i,
                    });
                }
            }
            b'=' | b'!' | b'<' | b'>' => {
                let two = i + 1 < bytes.len() && bytes[i + 1] == b'=';
                let len = if two { 2 } else { 1 };
                let text = &input[i..i + len];
                if text == "=" {
                    return Err(ExprError::UnexpectedToken {
                        expected: "`==`",
                        found: "=".into(),
                        position: i,
                    });
                }
                tokens.push(Token { kind: TokenKind::Op, text: text.into(), position: i });
                i += len;
            }
            b'\'' | b'"' => {
                let quote = b;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ExprError::UnexpectedEnd);
                }
                tokens.push(Token {
                    kind: TokenKind::Str,
                    text: input[start..j].to_string(),
                    position: i,
                });
                i = j + 1;
            }
            b'0'..=b'9' | b'-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    text: input[start..i].to_string(),
                    position: start,
                });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    text: input[start..i].to_string(),
                    position: start,
                });
            }
            _ => {
                return Err(ExprError::UnexpectedToken {
                    expected: "a token",
                    found: (b as char).to_string(),
                    position: i,
                });
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Op && t.text == op)
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn check_depth(depth: usize) -> Result<(), ExprError> {
        if depth >= MAX_NESTING {
            return Err(ExprError::NestingTooDeep { max_depth: MAX_NESTING });
        }
        Ok(())
    }

    /// `depth` counts parenthesis nesting only; precedence recursion is
    /// bounded by the grammar itself.
    fn parse_or(&mut self, depth: usize) -> Result<Expr, ExprError> {
        Self::check_depth(depth)?;
        let mut left = self.parse_and(depth)?;
        while self.eat_op("||") {
            let right = self.parse_and(depth)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison(depth)?;
        while self.eat_op("&&") {
            let right = self.parse_comparison(depth)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let left = self.parse_unary(depth)?;
        let op = match self.peek() {
            Some(t) if t.kind == TokenKind::Op => match t.text.as_str() {
                "==" => Some(CompareOp::Eq),
                "!=" => Some(CompareOp::Ne),
                "<" => Some(CompareOp::Lt),
                "<=" => Some(CompareOp::Le),
                ">" => Some(CompareOp::Gt),
                ">=" => Some(CompareOp::Ge),
                _ => None,
            },
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.parse_unary(depth)?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Expr, ExprError> {
        Self::check_depth(depth)?;
        if self.eat_op("!") {
            let inner = self.parse_unary(depth + 1)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary(depth)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let Some(tok) = self.bump() else {
            return Err(ExprError::UnexpectedEnd);
        };
        match tok.kind {
            TokenKind::LParen => {
                let inner = self.parse_or(depth + 1)?;
                match self.bump() {
                    Some(t) if t.kind == TokenKind::RParen => Ok(inner),
                    Some(t) => Err(ExprError::UnexpectedToken {
                        expected: "`)`",
                        found: t.text,
                        position: t.position,
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            TokenKind::Number => {
                let n: f64 = tok.text.parse().map_err(|_| ExprError::UnexpectedToken {
                    expected: "a number",
                    found: tok.text.clone(),
                    position: tok.position,
                })?;
                let value = if tok.text.contains('.') {
                    serde_json::Number::from_f64(n).map(Value::Number)
                } else {
                    tok.text.parse::<i64>().ok().map(|i| Value::Number(i.into()))
                };
                let value = value.ok_or(ExprError::UnexpectedToken {
                    expected: "a finite number",
                    found: tok.text.clone(),
                    position: tok.position,
                })?;
                Ok(Expr::Literal(value))
            }
            TokenKind::Str => Ok(Expr::Literal(Value::String(tok.text))),
            TokenKind::Ident => match tok.text.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut segments = vec![tok.text];
                    while self.peek().is_some_and(|t| t.kind == TokenKind::Dot) {
                        self.pos += 1;
                        match self.bump() {
                            Some(t) if t.kind == TokenKind::Ident => segments.push(t.text),
                            Some(t) => {
                                return Err(ExprError::UnexpectedToken {
                                    expected: "a field name",
                                    found: t.text,
                                    position: t.position,
                                });
                            }
                            None => return Err(ExprError::UnexpectedEnd),
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            _ => Err(ExprError::UnexpectedToken {
                expected: "a value",
                found: tok.text,
                position: tok.position,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_bool(v: &Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(ExprError::NotABoolean { found: type_name(other) }),
    }
}

/// Resolve a dotted path. The leading `output` segment names the document
/// root; missing fields resolve to `null`.
fn resolve_path(segments: &[String], document: &Value) -> Value {
    let rest = match segments.first().map(String::as_str) {
        Some("output") => &segments[1..],
        _ => segments,
    };
    let mut current = document;
    for seg in rest {
        match current.get(seg) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn eval_value(expr: &Expr, document: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(resolve_path(segments, document)),
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(&eval_value(inner, document)?)?)),
        Expr::And(l, r) => {
            if !as_bool(&eval_value(l, document)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval_value(r, document)?)?))
        }
        Expr::Or(l, r) => {
            if as_bool(&eval_value(l, document)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval_value(r, document)?)?))
        }
        Expr::Compare { op, left, right } => {
            let l = eval_value(left, document)?;
            let r = eval_value(right, document)?;
            compare(*op, &l, &r).map(Value::Bool)
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    match op {
        CompareOp::Eq => Ok(loose_eq(left, right)),
        CompareOp::Ne => Ok(!loose_eq(left, right)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64(), b.as_f64());
                    match (a, b) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(ExprError::TypeMismatch {
                    op: op.to_string(),
                    left: type_name(left),
                    right: type_name(right),
                });
            };
            Ok(match op {
                CompareOp::Lt => ordering == std::cmp::Ordering::Less,
                CompareOp::Le => ordering != std::cmp::Ordering::Greater,
                CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
                CompareOp::Ge => ordering != std::cmp::Ordering::Less,
                CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

/// Equality with numeric coercion: `1` and `1.0` are equal.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Value::Number(a), Value::Number(b)) = (left, right)
        && let (Some(a), Some(b)) = (a.as_f64(), b.as_f64())
    {
        return a == b;
    }
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparisons() {
        let doc = json!({"score": 85});
        assert!(evaluate_str("output.score >= 80", &doc).unwrap());
        assert!(!evaluate_str("output.score < 80", &doc).unwrap());
        assert!(evaluate_str("output.score == 85", &doc).unwrap());
        assert!(evaluate_str("output.score == 85.0", &doc).unwrap());
    }

    #[test]
    fn string_comparisons() {
        let doc = json!({"status": "error"});
        assert!(evaluate_str("output.status != 'success'", &doc).unwrap());
        assert!(evaluate_str("output.status == \"error\"", &doc).unwrap());
    }

    #[test]
    fn bare_field_names_address_the_root() {
        let doc = json!({"score": 42});
        assert!(evaluate_str("score > 40", &doc).unwrap());
    }

    #[test]
    fn boolean_composition_and_parens() {
        let doc = json!({"a": 1, "b": 2, "ok": true});
        assert!(evaluate_str("(a == 1 && b == 2) || a == 9", &doc).unwrap());
        assert!(evaluate_str("!(a == 9) && ok", &doc).unwrap());
        assert!(!evaluate_str("ok && a == 9", &doc).unwrap());
    }

    #[test]
    fn missing_paths_are_null() {
        let doc = json!({});
        assert!(evaluate_str("output.gone == null", &doc).unwrap());
        assert!(!evaluate_str("output.gone == 1", &doc).unwrap());
        // Null in boolean position is false, so a bare missing path is false.
        assert!(!evaluate_str("output.gone", &doc).unwrap());
    }

    #[test]
    fn nested_paths_descend() {
        let doc = json!({"result": {"inner": {"n": 3}}});
        assert!(evaluate_str("output.result.inner.n == 3", &doc).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let doc = json!({"s": "abc"});
        let err = evaluate_str("output.s > 3", &doc).unwrap_err();
        assert!(matches!(err, ExprError::TypeMismatch { .. }));
    }

    #[test]
    fn non_boolean_conjunct_is_an_error() {
        let doc = json!({"n": 3});
        let err = evaluate_str("output.n && true", &doc).unwrap_err();
        assert!(matches!(err, ExprError::NotABoolean { found: "number" }));
    }

    #[test]
    fn parse_errors_carry_positions() {
        let err = parse("a == ").unwrap_err();
        assert_eq!(err, ExprError::UnexpectedEnd);

        let err = parse("a = 1").unwrap_err();
        assert!(matches!(err, ExprError::UnexpectedToken { position: 2, .. }));

        assert_eq!(parse("   "), Err(ExprError::EmptyInput));
    }

    #[test]
    fn trailing_input_rejected() {
        let err = parse("a == 1 b").unwrap_err();
        assert!(matches!(
            err,
            ExprError::UnexpectedToken { expected: "end of expression", .. }
        ));
    }

    #[test]
    fn deep_nesting_rejected() {
        let expr = format!("{}true{}", "(".repeat(64), ")".repeat(64));
        assert!(matches!(
            parse(&expr),
            Err(ExprError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn negative_numbers_parse() {
        let doc = json!({"delta": -5});
        assert!(evaluate_str("output.delta < 0", &doc).unwrap());
        assert!(evaluate_str("output.delta == -5", &doc).unwrap());
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    proptest! {
        // Untrusted input must never panic the parser.
        #[test]
        fn parse_never_panics(input in ".{0,256}") {
            let _ = super::parse(&input);
        }

        #[test]
        fn comparison_round_trips(n in -1000i64..1000) {
            let doc = serde_json::json!({"n": n});
            let ge = super::evaluate_str("output.n >= 0", &doc).unwrap();
            prop_assert_eq!(ge, n >= 0);
        }
    }
}
