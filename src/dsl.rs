//! DSL Compiler (§4.H): turns a JSON assertion document into a compiled,
//! typed predicate tree the Assertion Engine can evaluate in O(1) per
//! operator dispatch. Normalization is applied before validation so that
//! `compile(compile(spec)) == compile(spec)`.

use crate::core::{CoreError, Result, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    Added,
    Removed,
    Changed,
    Unchanged,
}

impl DiffType {
    fn parse(s: &str, path: &str) -> Result<Self> {
        match s {
            "added" => Ok(Self::Added),
            "removed" => Ok(Self::Removed),
            "changed" => Ok(Self::Changed),
            "unchanged" => Ok(Self::Unchanged),
            other => Err(CoreError::DslInvalid {
                path: path.to_string(),
                reason: format!("unknown diff_type '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    HasAny,
    HasAll,
    IsNull,
    NotNull,
}

impl Operator {
    fn parse(name: &str, path: &str) -> Result<Self> {
        Ok(match name {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "has_any" => Self::HasAny,
            "has_all" => Self::HasAll,
            "is_null" => Self::IsNull,
            "not_null" => Self::NotNull,
            other => {
                return Err(CoreError::DslInvalid {
                    path: path.to_string(),
                    reason: format!("unknown operator '{other}'"),
                });
            }
        })
    }
}

/// One `field { op: operand }` leaf, or a recursive combinator.
#[derive(Debug, Clone)]
pub enum Predicate {
    Leaf { field: String, op: Operator, operand: Json },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluates this predicate against a row projected as field→Value.
    pub fn eval(&self, row: &std::collections::HashMap<String, Value>) -> bool {
        match self {
            Predicate::And(preds) => preds.iter().all(|p| p.eval(row)),
            Predicate::Or(preds) => preds.iter().any(|p| p.eval(row)),
            Predicate::Not(inner) => !inner.eval(row),
            Predicate::Leaf { field, op, operand } => {
                let value = row.get(field);
                eval_leaf(*op, value, operand)
            }
        }
    }
}

fn eval_leaf(op: Operator, value: Option<&Value>, operand: &Json) -> bool {
    match op {
        Operator::IsNull => value.is_none_or(Value::is_null),
        Operator::NotNull => value.is_some_and(|v| !v.is_null()),
        _ => {
            let Some(value) = value else { return false };
            if value.is_null() {
                return false;
            }
            let operand_value = Value::from_json(operand);
            match op {
                Operator::Eq => value == &operand_value,
                Operator::Neq => value != &operand_value,
                Operator::Gt => value > &operand_value,
                Operator::Gte => value >= &operand_value,
                Operator::Lt => value < &operand_value,
                Operator::Lte => value <= &operand_value,
                Operator::In => operand
                    .as_array()
                    .map(|items| items.iter().any(|item| Value::from_json(item) == *value))
                    .unwrap_or(false),
                Operator::NotIn => operand
                    .as_array()
                    .map(|items| items.iter().all(|item| Value::from_json(item) != *value))
                    .unwrap_or(true),
                Operator::Contains => match (value.as_str(), operand.as_str()) {
                    (Some(s), Some(needle)) => s.contains(needle),
                    _ => false,
                },
                Operator::NotContains => match (value.as_str(), operand.as_str()) {
                    (Some(s), Some(needle)) => !s.contains(needle),
                    _ => true,
                },
                Operator::StartsWith => match (value.as_str(), operand.as_str()) {
                    (Some(s), Some(prefix)) => s.starts_with(prefix),
                    _ => false,
                },
                Operator::EndsWith => match (value.as_str(), operand.as_str()) {
                    (Some(s), Some(suffix)) => s.ends_with(suffix),
                    _ => false,
                },
                Operator::HasAny => match value.as_array() {
                    Some(items) => operand
                        .as_array()
                        .map(|wanted| wanted.iter().any(|w| items.contains(&Value::from_json(w))))
                        .unwrap_or(false),
                    None => false,
                },
                Operator::HasAll => match value.as_array() {
                    Some(items) => operand
                        .as_array()
                        .map(|wanted| wanted.iter().all(|w| items.contains(&Value::from_json(w))))
                        .unwrap_or(false),
                    None => false,
                },
                Operator::IsNull | Operator::NotNull => unreachable!(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CountBound {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ExpectedChange {
    pub field: String,
    pub from: Option<Predicate>,
    pub to: Option<Predicate>,
}

#[derive(Debug, Clone)]
pub struct CompiledAssertion {
    pub diff_type: DiffType,
    pub entity: String,
    pub where_predicate: Option<Predicate>,
    pub expected_count: Option<CountBound>,
    pub expected_changes: Vec<ExpectedChange>,
    pub local_ignore: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledSpec {
    pub strict: bool,
    pub masks: Vec<String>,
    pub assertions: Vec<CompiledAssertion>,
}

const TOP_LEVEL_KEYS: &[&str] = &["dsl_version", "strict", "masks", "assertions"];
const ASSERTION_KEYS: &[&str] = &[
    "diff_type",
    "entity",
    "where",
    "expected_count",
    "expected_changes",
    "local_ignore",
];

pub fn compile(spec: &Json) -> Result<CompiledSpec> {
    let obj = spec.as_object().ok_or_else(|| CoreError::DslInvalid {
        path: "$".into(),
        reason: "spec must be a JSON object".into(),
    })?;

    for key in obj.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            return Err(CoreError::DslInvalid {
                path: format!("${key}"),
                reason: format!("unknown top-level key '{key}'"),
            });
        }
    }

    if let Some(version) = obj.get("dsl_version") {
        let version = version.as_str().unwrap_or("");
        if version != "1" {
            return Err(CoreError::DslInvalid {
                path: "$.dsl_version".into(),
                reason: format!("unsupported dsl_version '{version}'"),
            });
        }
    }

    let strict = obj.get("strict").and_then(Json::as_bool).unwrap_or(false);
    let masks = obj
        .get("masks")
        .map(|m| parse_string_array(m, "$.masks"))
        .transpose()?
        .unwrap_or_default();

    let assertions_json = obj
        .get("assertions")
        .and_then(Json::as_array)
        .ok_or_else(|| CoreError::DslInvalid {
            path: "$.assertions".into(),
            reason: "assertions must be a non-null array".into(),
        })?;

    let mut assertions = Vec::with_capacity(assertions_json.len());
    for (idx, assertion_json) in assertions_json.iter().enumerate() {
        let path = format!("assertions[{idx}]");
        assertions.push(compile_assertion(assertion_json, &path)?);
    }

    Ok(CompiledSpec { strict, masks, assertions })
}

fn parse_string_array(value: &Json, path: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| CoreError::DslInvalid {
            path: path.to_string(),
            reason: "expected an array of strings".into(),
        })?
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| CoreError::DslInvalid {
                path: path.to_string(),
                reason: "expected a string element".into(),
            })
        })
        .collect()
}

fn compile_assertion(json: &Json, path: &str) -> Result<CompiledAssertion> {
    let obj = json.as_object().ok_or_else(|| CoreError::DslInvalid {
        path: path.to_string(),
        reason: "assertion must be an object".into(),
    })?;

    for key in obj.keys() {
        if !ASSERTION_KEYS.contains(&key.as_str()) {
            return Err(CoreError::DslInvalid {
                path: format!("{path}.{key}"),
                reason: format!("unknown assertion key '{key}'"),
            });
        }
    }

    let diff_type_str = obj
        .get("diff_type")
        .and_then(Json::as_str)
        .ok_or_else(|| CoreError::DslInvalid {
            path: format!("{path}.diff_type"),
            reason: "diff_type is required".into(),
        })?;
    let diff_type = DiffType::parse(diff_type_str, &format!("{path}.diff_type"))?;

    let entity = obj
        .get("entity")
        .and_then(Json::as_str)
        .ok_or_else(|| CoreError::DslInvalid {
            path: format!("{path}.entity"),
            reason: "entity is required".into(),
        })?
        .to_string();

    let where_predicate = obj
        .get("where")
        .map(|w| compile_where(w, &format!("{path}.where")))
        .transpose()?;

    let expected_count = obj
        .get("expected_count")
        .map(|c| compile_count(c, &format!("{path}.expected_count")))
        .transpose()?;

    let expected_changes = obj
        .get("expected_changes")
        .map(|c| compile_expected_changes(c, &format!("{path}.expected_changes")))
        .transpose()?
        .unwrap_or_default();

    let local_ignore = obj
        .get("local_ignore")
        .map(|v| parse_string_array(v, &format!("{path}.local_ignore")))
        .transpose()?
        .unwrap_or_default();

    Ok(CompiledAssertion {
        diff_type,
        entity,
        where_predicate,
        expected_count,
        expected_changes,
        local_ignore,
    })
}

/// Normalizes and compiles a `where` node. Shorthand: `{field: scalar}` ⇒
/// `{field: {eq: scalar}}`; combinators `and`/`or`/`not` recurse.
fn compile_where(json: &Json, path: &str) -> Result<Predicate> {
    let obj = json.as_object().ok_or_else(|| CoreError::DslInvalid {
        path: path.to_string(),
        reason: "where must be an object".into(),
    })?;

    if let Some(and) = obj.get("and") {
        return Ok(Predicate::And(compile_predicate_list(and, &format!("{path}.and"))?));
    }
    if let Some(or) = obj.get("or") {
        return Ok(Predicate::Or(compile_predicate_list(or, &format!("{path}.or"))?));
    }
    if let Some(not) = obj.get("not") {
        return Ok(Predicate::Not(Box::new(compile_where(not, &format!("{path}.not"))?)));
    }

    let mut leaves = Vec::with_capacity(obj.len());
    for (field, spec) in obj {
        leaves.push(compile_field_leaf(field, spec, &format!("{path}.{field}"))?);
    }
    Ok(if leaves.len() == 1 {
        leaves.into_iter().next().unwrap()
    } else {
        Predicate::And(leaves)
    })
}

fn compile_predicate_list(json: &Json, path: &str) -> Result<Vec<Predicate>> {
    json.as_array()
        .ok_or_else(|| CoreError::DslInvalid {
            path: path.to_string(),
            reason: "combinator must be given an array".into(),
        })?
        .iter()
        .enumerate()
        .map(|(idx, item)| compile_where(item, &format!("{path}[{idx}]")))
        .collect()
}

/// `{field: {op: operand}}` or shorthand `{field: scalar}`.
fn compile_field_leaf(field: &str, spec: &Json, path: &str) -> Result<Predicate> {
    if let Some(ops) = spec.as_object() {
        if ops.len() == 1 {
            let (op_name, operand) = ops.iter().next().unwrap();
            let op = Operator::parse(op_name, path)?;
            return Ok(Predicate::Leaf {
                field: field.to_string(),
                op,
                operand: operand.clone(),
            });
        }
        if ops.is_empty() {
            return Err(CoreError::DslInvalid {
                path: path.to_string(),
                reason: "empty operator object".into(),
            });
        }
        let leaves = ops
            .iter()
            .map(|(op_name, operand)| {
                Operator::parse(op_name, path).map(|op| Predicate::Leaf {
                    field: field.to_string(),
                    op,
                    operand: operand.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Predicate::And(leaves));
    }

    // Shorthand: `{field: scalar}` ⇒ `{field: {eq: scalar}}`.
    Ok(Predicate::Leaf {
        field: field.to_string(),
        op: Operator::Eq,
        operand: spec.clone(),
    })
}

/// `expected_count: N` shorthand expands to `{min: N, max: N}`.
fn compile_count(json: &Json, path: &str) -> Result<CountBound> {
    if let Some(n) = json.as_i64() {
        return Ok(CountBound { min: Some(n), max: Some(n) });
    }
    let obj = json.as_object().ok_or_else(|| CoreError::DslInvalid {
        path: path.to_string(),
        reason: "expected_count must be an integer or {min,max} object".into(),
    })?;
    Ok(CountBound {
        min: obj.get("min").and_then(Json::as_i64),
        max: obj.get("max").and_then(Json::as_i64),
    })
}

/// `expected_changes: {field: scalar}` shorthand expands to
/// `{field: {to: {eq: scalar}}}`; `{field: {from, to}}` form compiles each
/// side as a `where`-shaped predicate.
fn compile_expected_changes(json: &Json, path: &str) -> Result<Vec<ExpectedChange>> {
    let obj = json.as_object().ok_or_else(|| CoreError::DslInvalid {
        path: path.to_string(),
        reason: "expected_changes must be an object".into(),
    })?;

    let mut changes = Vec::with_capacity(obj.len());
    for (field, spec) in obj {
        let field_path = format!("{path}.{field}");
        if let Some(sides) = spec.as_object().filter(|o| o.contains_key("from") || o.contains_key("to")) {
            let from = sides
                .get("from")
                .map(|f| compile_field_leaf(field, f, &format!("{field_path}.from")))
                .transpose()?;
            let to = sides
                .get("to")
                .map(|t| compile_field_leaf(field, t, &format!("{field_path}.to")))
                .transpose()?;
            changes.push(ExpectedChange { field: field.clone(), from, to });
        } else {
            // Shorthand: bare scalar/operand means "to" must equal it.
            let to = compile_field_leaf(field, spec, &field_path)?;
            changes.push(ExpectedChange { field: field.clone(), from: None, to: Some(to) });
        }
    }
    Ok(changes)
}
