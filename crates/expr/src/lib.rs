//! Stagehand expressions: a small path language evaluated against object trees.
//!
//! Grammar (whitespace is ignored between tokens):
//!
//! ```text
//! expr    := primary
//! primary := path | var | literal | call | '(' expr ')'
//! path    := '.' [ ident | index ] ( '.' ident | index )*
//! index   := '[' ( string | integer ) ']'
//! var     := '$' ident ( '.' ident | index )*
//! call    := ident '(' [ expr ( ',' expr )* ] ')'
//! ```
//!
//! Missing fields evaluate to `null`; indexing into a scalar is a type error.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use stagehand_core::{EvalContext, EvalError, Evaluator};

mod duration;
mod template;

pub use duration::{delay_from_value, format_duration, parse_duration, DelayValue};
pub use template::{render, render_string};

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    /// Negative indices count from the end.
    Index(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(Vec<Segment>),
    Var(String, Vec<Segment>),
    Literal(Json),
    Call(String, Vec<Expr>),
}

/// Parse an expression; the whole input must be consumed.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let mut p = Parser { src, pos: 0 };
    let e = p.expr()?;
    p.skip_ws();
    if p.pos != src.len() {
        return Err(p.error(format!("unexpected trailing input at {}", p.pos)));
    }
    Ok(e)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse { expr: self.src.to_string(), message: message.into() }
    }

    fn peek(&self) -> Option<char> { self.src[self.pos..].chars().next() }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) { self.bump(); }
    }

    fn eat(&mut self, want: char) -> bool {
        if self.peek() == Some(want) { self.bump(); true } else { false }
    }

    fn expect(&mut self, want: char) -> Result<(), EvalError> {
        self.skip_ws();
        if self.eat(want) { Ok(()) } else { Err(self.error(format!("expected '{}' at {}", want, self.pos))) }
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("empty expression")),
            Some('.') => {
                self.bump();
                let mut segs = Vec::new();
                if self.peek().map(is_ident_start).unwrap_or(false) {
                    segs.push(Segment::Field(self.ident()));
                }
                self.suffixes(&mut segs)?;
                Ok(Expr::Path(segs))
            }
            Some('$') => {
                self.bump();
                if !self.peek().map(is_ident_start).unwrap_or(false) {
                    return Err(self.error("expected variable name after '$'"));
                }
                let name = self.ident();
                let mut segs = Vec::new();
                self.suffixes(&mut segs)?;
                Ok(Expr::Var(name, segs))
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Json::String(self.string()?))),
            Some('(') => {
                self.bump();
                let e = self.expr()?;
                self.expect(')')?;
                Ok(e)
            }
            Some(c) if c == '-' || c.is_ascii_digit() => self.number().map(Expr::Literal),
            Some(c) if is_ident_start(c) => {
                let name = self.ident();
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Json::Bool(true))),
                    "false" => return Ok(Expr::Literal(Json::Bool(false))),
                    "null" => return Ok(Expr::Literal(Json::Null)),
                    _ => {}
                }
                self.expect('(')?;
                let mut args = Vec::new();
                self.skip_ws();
                if !self.eat(')') {
                    loop {
                        args.push(self.expr()?);
                        self.skip_ws();
                        if self.eat(',') { continue; }
                        self.expect(')')?;
                        break;
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Some(c) => Err(self.error(format!("unexpected '{}' at {}", c, self.pos))),
        }
    }

    fn suffixes(&mut self, segs: &mut Vec<Segment>) -> Result<(), EvalError> {
        loop {
            match self.peek() {
                Some('.') => {
                    self.bump();
                    if self.peek() == Some('[') { continue; }
                    if !self.peek().map(is_ident_start).unwrap_or(false) {
                        return Err(self.error(format!("expected field name at {}", self.pos)));
                    }
                    segs.push(Segment::Field(self.ident()));
                }
                Some('[') => {
                    self.bump();
                    self.skip_ws();
                    let seg = match self.peek() {
                        Some('"') | Some('\'') => Segment::Field(self.string()?),
                        Some(c) if c == '-' || c.is_ascii_digit() => match self.number()? {
                            Json::Number(n) if n.is_i64() => Segment::Index(n.as_i64().unwrap_or_default()),
                            _ => return Err(self.error("array index must be an integer")),
                        },
                        _ => return Err(self.error(format!("expected string or integer index at {}", self.pos))),
                    };
                    self.expect(']')?;
                    segs.push(seg);
                }
                _ => return Ok(()),
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().map(is_ident_char).unwrap_or(false) { self.bump(); }
        self.src[start..self.pos].to_string()
    }

    fn string(&mut self) -> Result<String, EvalError> {
        let quote = self.bump().unwrap_or('"');
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Json, EvalError> {
        let start = self.pos;
        if self.peek() == Some('-') { self.bump(); }
        while self.peek().map(|c| c.is_ascii_digit() || c == '.').unwrap_or(false) { self.bump(); }
        let text = &self.src[start..self.pos];
        if let Ok(i) = text.parse::<i64>() { return Ok(Json::from(i)); }
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number)
            .ok_or_else(|| self.error(format!("invalid number {:?}", text)))
    }
}

fn is_ident_start(c: char) -> bool { c.is_ascii_alphabetic() || c == '_' }

fn is_ident_char(c: char) -> bool { c.is_ascii_alphanumeric() || c == '_' || c == '-' }

fn lookup<'v>(expr_src: &str, root: &'v Json, segs: &[Segment]) -> Result<Option<&'v Json>, EvalError> {
    let mut cur = root;
    for seg in segs {
        cur = match (seg, cur) {
            (_, Json::Null) => return Ok(None),
            (Segment::Field(k), Json::Object(map)) => match map.get(k) { Some(v) => v, None => return Ok(None) },
            (Segment::Index(i), Json::Array(arr)) => {
                let idx = if *i < 0 { arr.len() as i64 + *i } else { *i };
                match (idx >= 0).then(|| arr.get(idx as usize)).flatten() { Some(v) => v, None => return Ok(None) }
            }
            (seg, other) => {
                return Err(EvalError::Type {
                    expr: expr_src.to_string(),
                    message: format!("cannot index {} with {:?}", type_name(other), seg),
                })
            }
        };
    }
    Ok(Some(cur))
}

pub fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Scalar rendering used for selector comparisons and string interpolation.
pub fn to_plain_string(v: &Json) -> String {
    match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Evaluate a parsed expression.
pub fn eval(expr_src: &str, e: &Expr, ctx: &EvalContext<'_>) -> Result<Json, EvalError> {
    match e {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segs) => Ok(lookup(expr_src, ctx.root, segs)?.cloned().unwrap_or(Json::Null)),
        Expr::Var(name, segs) => {
            let v = ctx.var(name).ok_or_else(|| EvalError::UnknownVariable {
                expr: expr_src.to_string(),
                name: name.clone(),
            })?;
            Ok(lookup(expr_src, v, segs)?.cloned().unwrap_or(Json::Null))
        }
        Expr::Call(name, args) => call(expr_src, name, args, ctx),
    }
}

fn call(expr_src: &str, name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<Json, EvalError> {
    let arity = |n: usize| -> Result<(), EvalError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::Type { expr: expr_src.to_string(), message: format!("{name} takes {n} argument(s)") })
        }
    };
    match name {
        "default" => {
            arity(2)?;
            let v = eval(expr_src, &args[0], ctx)?;
            if v.is_null() { eval(expr_src, &args[1], ctx) } else { Ok(v) }
        }
        "string" => {
            arity(1)?;
            Ok(Json::String(to_plain_string(&eval(expr_src, &args[0], ctx)?)))
        }
        "length" => {
            arity(1)?;
            match eval(expr_src, &args[0], ctx)? {
                Json::Null => Ok(Json::from(0)),
                Json::String(s) => Ok(Json::from(s.chars().count())),
                Json::Array(a) => Ok(Json::from(a.len())),
                Json::Object(o) => Ok(Json::from(o.len())),
                other => Err(EvalError::Type {
                    expr: expr_src.to_string(),
                    message: format!("length of {}", type_name(&other)),
                }),
            }
        }
        "join" => {
            arity(2)?;
            let sep = to_plain_string(&eval(expr_src, &args[1], ctx)?);
            match eval(expr_src, &args[0], ctx)? {
                Json::Null => Ok(Json::String(String::new())),
                Json::Array(a) => Ok(Json::String(a.iter().map(to_plain_string).collect::<Vec<_>>().join(&sep))),
                other => Err(EvalError::Type {
                    expr: expr_src.to_string(),
                    message: format!("join of {}", type_name(&other)),
                }),
            }
        }
        "now" => {
            arity(0)?;
            ctx.var("now").cloned().ok_or_else(|| EvalError::UnknownVariable {
                expr: expr_src.to_string(),
                name: "now".into(),
            })
        }
        "keys" => {
            arity(1)?;
            match eval(expr_src, &args[0], ctx)? {
                Json::Object(o) => Ok(Json::Array(o.keys().cloned().map(Json::String).collect())),
                Json::Null => Ok(Json::Array(Vec::new())),
                other => Err(EvalError::Type {
                    expr: expr_src.to_string(),
                    message: format!("keys of {}", type_name(&other)),
                }),
            }
        }
        _ => Err(EvalError::UnknownFunction { expr: expr_src.to_string(), name: name.to_string() }),
    }
}

/// Default evaluator. Parsed expressions are cached by source text.
#[derive(Default)]
pub struct PathEvaluator {
    cache: RwLock<FxHashMap<String, Arc<Expr>>>,
}

const CACHE_CAP: usize = 4096;

impl PathEvaluator {
    pub fn new() -> Self { Self::default() }

    fn compiled(&self, src: &str) -> Result<Arc<Expr>, EvalError> {
        if let Ok(guard) = self.cache.read() {
            if let Some(e) = guard.get(src) { return Ok(Arc::clone(e)); }
        }
        let e = Arc::new(parse(src.trim())?);
        if let Ok(mut guard) = self.cache.write() {
            if guard.len() >= CACHE_CAP {
                tracing::debug!(entries = guard.len(), "expression cache full; clearing");
                guard.clear();
            }
            guard.insert(src.to_string(), Arc::clone(&e));
        }
        Ok(e)
    }
}

impl Evaluator for PathEvaluator {
    fn evaluate(&self, expr: &str, ctx: &EvalContext<'_>) -> Result<Json, EvalError> {
        let e = self.compiled(expr)?;
        eval(expr, &e, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj() -> Json {
        json!({
            "metadata": {
                "name": "p0",
                "labels": { "app.kubernetes.io/name": "web" },
                "finalizers": ["a", "b"]
            },
            "status": { "phase": "Pending", "conditions": [ { "type": "Ready", "status": "False" } ] }
        })
    }

    fn ev(src: &str) -> Result<Json, EvalError> {
        let root = obj();
        let ctx = EvalContext::new(&root).with_var("now", json!("2024-01-01T00:00:00Z"));
        PathEvaluator::new().evaluate(src, &ctx)
    }

    #[test]
    fn paths_and_indices() {
        assert_eq!(ev(".status.phase").unwrap(), json!("Pending"));
        assert_eq!(ev(".metadata.labels[\"app.kubernetes.io/name\"]").unwrap(), json!("web"));
        assert_eq!(ev(".status.conditions[0].type").unwrap(), json!("Ready"));
        assert_eq!(ev(".metadata.finalizers[-1]").unwrap(), json!("b"));
        assert_eq!(ev(".metadata.finalizers[9]").unwrap(), Json::Null);
        assert_eq!(ev(".spec.nodeName").unwrap(), Json::Null);
        assert_eq!(ev(".").unwrap(), obj());
    }

    #[test]
    fn indexing_scalars_is_a_type_error() {
        let err = ev(".status.phase.value").unwrap_err();
        assert!(matches!(err, EvalError::Type { .. }), "{err:?}");
    }

    #[test]
    fn functions_and_variables() {
        assert_eq!(ev("default(.spec.nodeName, 'none')").unwrap(), json!("none"));
        assert_eq!(ev("length(.metadata.finalizers)").unwrap(), json!(2));
        assert_eq!(ev("join(.metadata.finalizers, ',')").unwrap(), json!("a,b"));
        assert_eq!(ev("now()").unwrap(), json!("2024-01-01T00:00:00Z"));
        assert_eq!(ev("$now").unwrap(), json!("2024-01-01T00:00:00Z"));
        assert_eq!(ev("string(12)").unwrap(), json!("12"));
        assert!(matches!(ev("$missing").unwrap_err(), EvalError::UnknownVariable { .. }));
        assert!(matches!(ev("nope(1)").unwrap_err(), EvalError::UnknownFunction { .. }));
    }

    #[test]
    fn parse_errors_are_reported() {
        for bad in ["", ".a[", ".a.", "'open", ".a b", "$"] {
            assert!(matches!(parse(bad), Err(EvalError::Parse { .. })), "expected parse error for {bad:?}");
        }
    }
}
