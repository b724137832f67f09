//! Filter parsing and evaluation.
//!
//! Filters use the Mongo-style JSON shape: `{field: value}` for equality,
//! `{field: {$op: value}}` for operators, and `$and` / `$or` / `$nor` /
//! `$not` for composition. Dotted paths descend into nested objects (and
//! into arrays by numeric segment).

use crate::error::{LiveError, Result};
use crate::types::Document;
use serde_json::Value;
use std::cmp::Ordering;

/// Nesting limit for paths and logical operators.
const MAX_DEPTH: usize = 32;

/// Upper bound on `$in` / `$nin` set sizes.
const MAX_IN_SET: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Clone, Debug, PartialEq)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Cmp(CmpOp, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Not(Box<Condition>),
    All(Vec<Condition>),
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    True,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Not(Box<Expr>),
    Field { path: String, cond: Condition },
}

/// A parsed filter. Keeps the JSON it was parsed from so external stores can
/// translate it to their own query language.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    raw: Value,
    expr: Expr,
}

impl Filter {
    /// Parse a JSON filter document.
    pub fn parse(raw: &Value) -> Result<Self> {
        let expr = parse_expr(raw, 0)?;
        Ok(Self {
            raw: raw.clone(),
            expr,
        })
    }

    /// The JSON this filter was parsed from.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn matches(&self, doc: &Document) -> bool {
        eval_expr(doc, &self.expr)
    }
}

fn invalid(msg: impl Into<String>) -> LiveError {
    LiveError::InvalidFilter(msg.into())
}

fn parse_expr(raw: &Value, depth: usize) -> Result<Expr> {
    if depth > MAX_DEPTH {
        return Err(invalid("filter nested too deeply"));
    }
    let Value::Object(map) = raw else {
        return Err(invalid(format!("filter must be an object, got {}", raw)));
    };

    let mut parts = Vec::with_capacity(map.len());
    for (key, value) in map {
        let part = match key.as_str() {
            "$and" => Expr::And(parse_expr_list(key, value, depth)?),
            "$or" => Expr::Or(parse_expr_list(key, value, depth)?),
            "$nor" => Expr::Nor(parse_expr_list(key, value, depth)?),
            "$not" => Expr::Not(Box::new(parse_expr(value, depth + 1)?)),
            op if op.starts_with('$') => {
                return Err(invalid(format!("unknown top-level operator {}", op)));
            }
            path => {
                if path.is_empty() || path.split('.').count() > MAX_DEPTH {
                    return Err(invalid(format!("invalid field path {:?}", path)));
                }
                Expr::Field {
                    path: path.to_string(),
                    cond: parse_condition(value, depth + 1)?,
                }
            }
        };
        parts.push(part);
    }

    Ok(match parts.len() {
        0 => Expr::True,
        1 => parts.pop().unwrap_or(Expr::True),
        _ => Expr::And(parts),
    })
}

fn parse_expr_list(op: &str, value: &Value, depth: usize) -> Result<Vec<Expr>> {
    let Value::Array(items) = value else {
        return Err(invalid(format!("{} expects an array", op)));
    };
    if items.is_empty() {
        return Err(invalid(format!("{} expects a non-empty array", op)));
    }
    items.iter().map(|v| parse_expr(v, depth + 1)).collect()
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_condition(value: &Value, depth: usize) -> Result<Condition> {
    if depth > MAX_DEPTH {
        return Err(invalid("filter nested too deeply"));
    }
    if !is_operator_object(value) {
        return Ok(Condition::Eq(value.clone()));
    }
    let Value::Object(map) = value else {
        return Ok(Condition::Eq(value.clone()));
    };

    let mut conds = Vec::with_capacity(map.len());
    for (op, arg) in map {
        let cond = match op.as_str() {
            "$eq" => Condition::Eq(arg.clone()),
            "$ne" => Condition::Ne(arg.clone()),
            "$gt" => Condition::Cmp(CmpOp::Gt, arg.clone()),
            "$gte" => Condition::Cmp(CmpOp::Gte, arg.clone()),
            "$lt" => Condition::Cmp(CmpOp::Lt, arg.clone()),
            "$lte" => Condition::Cmp(CmpOp::Lte, arg.clone()),
            "$in" => Condition::In(parse_set(op, arg)?),
            "$nin" => Condition::Nin(parse_set(op, arg)?),
            "$exists" => match arg {
                Value::Bool(b) => Condition::Exists(*b),
                _ => return Err(invalid("$exists expects a boolean")),
            },
            "$not" => {
                if !is_operator_object(arg) {
                    return Err(invalid("$not expects an operator object"));
                }
                Condition::Not(Box::new(parse_condition(arg, depth + 1)?))
            }
            other => return Err(invalid(format!("unknown operator {}", other))),
        };
        conds.push(cond);
    }

    Ok(match conds.len() {
        1 => conds.pop().unwrap_or(Condition::All(Vec::new())),
        _ => Condition::All(conds),
    })
}

fn parse_set(op: &str, arg: &Value) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) if items.len() <= MAX_IN_SET => Ok(items.clone()),
        Value::Array(_) => Err(invalid(format!(
            "{} set larger than {} values",
            op, MAX_IN_SET
        ))),
        _ => Err(invalid(format!("{} expects an array", op))),
    }
}

fn eval_expr(doc: &Document, expr: &Expr) -> bool {
    match expr {
        Expr::True => true,
        Expr::And(es) => es.iter().all(|e| eval_expr(doc, e)),
        Expr::Or(es) => es.iter().any(|e| eval_expr(doc, e)),
        Expr::Nor(es) => !es.iter().any(|e| eval_expr(doc, e)),
        Expr::Not(e) => !eval_expr(doc, e),
        Expr::Field { path, cond } => eval_condition(get_path(doc, path), cond),
    }
}

fn eval_condition(value: Option<&Value>, cond: &Condition) -> bool {
    match cond {
        Condition::Eq(expected) => value.is_some_and(|v| matches_eq(v, expected)),
        Condition::Ne(expected) => !value.is_some_and(|v| matches_eq(v, expected)),
        Condition::Cmp(op, bound) => value.is_some_and(|v| matches_cmp(v, *op, bound)),
        Condition::In(set) => value.is_some_and(|v| set.iter().any(|x| matches_eq(v, x))),
        Condition::Nin(set) => !value.is_some_and(|v| set.iter().any(|x| matches_eq(v, x))),
        Condition::Exists(exists) => value.is_some() == *exists,
        Condition::Not(inner) => !eval_condition(value, inner),
        Condition::All(conds) => conds.iter().all(|c| eval_condition(value, c)),
    }
}

/// Equality, where an array field also matches any of its elements.
fn matches_eq(actual: &Value, expected: &Value) -> bool {
    if values_equal(actual, expected) {
        return true;
    }
    match actual {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn matches_cmp(actual: &Value, op: CmpOp, bound: &Value) -> bool {
    // Range operators only compare within one type class.
    if type_rank(actual) != type_rank(bound) {
        return false;
    }
    let ord = compare_values(actual, bound);
    match op {
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Gte => ord != Ordering::Less,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Lte => ord != Ordering::Greater,
    }
}

/// Resolve a dotted path inside a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut cur = doc.get(first)?;
    for (depth, part) in parts.enumerate() {
        if depth >= MAX_DEPTH {
            return None;
        }
        cur = match cur {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Structural equality with numeric normalization (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, x), (ky, y)) in xs.iter().zip(ys) {
                let ord = kx.cmp(ky).then_with(|| compare_values(x, y));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
