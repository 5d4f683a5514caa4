//! Assertion Engine (§4.I): evaluates a compiled DSL spec against a
//! [`Diff`], producing a pass/fail verdict with per-assertion failure
//! reasons. Never raises on a semantic mismatch — that's a `failure` in
//! the result, not an error.

use crate::differ::{Diff, TableDiff, UpdatedRow};
use crate::dsl::{CompiledAssertion, CompiledSpec, DiffType};
use crate::reflector::TableShape;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct AssertionFailure {
    pub assertion_index: usize,
    pub reason: String,
    pub observed: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Score {
    pub passed: usize,
    pub total: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub passed: bool,
    pub failures: Vec<AssertionFailure>,
    pub score: Score,
}

/// Row shape lookup the engine needs to project rows into field→Value
/// maps for predicate evaluation. Callers supply one [`TableShape`] per
/// entity referenced by the spec.
pub fn evaluate(spec: &CompiledSpec, diff: &Diff, shapes: &HashMap<String, TableShape>) -> AssertionResult {
    let mut failures = Vec::new();

    for (idx, assertion) in spec.assertions.iter().enumerate() {
        if let Err(failure) = evaluate_assertion(idx, assertion, spec, diff, shapes) {
            failures.push(failure);
        }
    }

    let total = spec.assertions.len();
    let passed = total - failures.len();
    AssertionResult {
        passed: failures.is_empty(),
        failures,
        score: Score {
            passed,
            total,
            percent: if total == 0 { 100.0 } else { (passed as f64 / total as f64) * 100.0 },
        },
    }
}

fn evaluate_assertion(
    idx: usize,
    assertion: &CompiledAssertion,
    spec: &CompiledSpec,
    diff: &Diff,
    shapes: &HashMap<String, TableShape>,
) -> Result<(), AssertionFailure> {
    let empty = TableDiff::default();
    let table_diff = diff.table(&assertion.entity).unwrap_or(&empty);
    let shape = shapes.get(&assertion.entity);

    match assertion.diff_type {
        DiffType::Added => {
            let matched = filter_rows(&table_diff.inserts, assertion, shape);
            check_count(idx, assertion, matched.len())
        }
        DiffType::Removed => {
            let matched = filter_rows(&table_diff.deletes, assertion, shape);
            check_count(idx, assertion, matched.len())
        }
        DiffType::Changed => {
            let matched = filter_updates(&table_diff.updates, assertion, shape);
            check_count(idx, assertion, matched.len())?;
            check_changes(idx, assertion, spec, &matched, shape)
        }
        DiffType::Unchanged => {
            // The unchanged bucket (§4.I) is rows present in both snapshots
            // with no changed fields. Without a `where`, the assertion
            // instead guards the whole entity: no insert/delete/update may
            // have happened anywhere in it. With a `where`, only rows in
            // that scope matter — an unrelated row changing elsewhere must
            // not fail the assertion, and a changed row inside the scope
            // must.
            match &assertion.where_predicate {
                None => {
                    if !table_diff.inserts.is_empty() || !table_diff.deletes.is_empty() || !table_diff.updates.is_empty()
                    {
                        return Err(AssertionFailure {
                            assertion_index: idx,
                            reason: format!("expected '{}' to be unchanged but it has pending diffs", assertion.entity),
                            observed: serde_json::json!({
                                "inserts": table_diff.inserts.len(),
                                "deletes": table_diff.deletes.len(),
                                "updates": table_diff.updates.len(),
                            }),
                        });
                    }
                    check_count(idx, assertion, table_diff.unchanged.len())
                }
                Some(pred) => {
                    let scoped_change = table_diff.inserts.iter().any(|row| pred.eval(&project(row, shape)))
                        || table_diff.deletes.iter().any(|row| pred.eval(&project(row, shape)))
                        || table_diff.updates.iter().any(|update| pred.eval(&project(&update.after, shape)));
                    if scoped_change {
                        return Err(AssertionFailure {
                            assertion_index: idx,
                            reason: format!(
                                "expected rows of '{}' matching 'where' to be unchanged but some were added, removed, or updated",
                                assertion.entity
                            ),
                            observed: serde_json::json!({
                                "inserts": table_diff.inserts.len(),
                                "deletes": table_diff.deletes.len(),
                                "updates": table_diff.updates.len(),
                            }),
                        });
                    }
                    let matched = filter_rows(&table_diff.unchanged, assertion, shape);
                    check_count(idx, assertion, matched.len())
                }
            }
        }
    }
}

fn project(row: &[crate::core::Value], shape: Option<&TableShape>) -> HashMap<String, crate::core::Value> {
    match shape {
        Some(shape) => shape
            .columns
            .iter()
            .enumerate()
            .filter_map(|(idx, col)| row.get(idx).map(|v| (col.name.clone(), v.clone())))
            .collect(),
        None => HashMap::new(),
    }
}

fn filter_rows<'a>(
    rows: &'a [Vec<crate::core::Value>],
    assertion: &CompiledAssertion,
    shape: Option<&TableShape>,
) -> Vec<&'a Vec<crate::core::Value>> {
    rows.iter()
        .filter(|row| match &assertion.where_predicate {
            Some(pred) => pred.eval(&project(row, shape)),
            None => true,
        })
        .collect()
}

fn filter_updates<'a>(
    updates: &'a [UpdatedRow],
    assertion: &CompiledAssertion,
    shape: Option<&TableShape>,
) -> Vec<&'a UpdatedRow> {
    updates
        .iter()
        .filter(|update| match &assertion.where_predicate {
            Some(pred) => pred.eval(&project(&update.after, shape)),
            None => true,
        })
        .collect()
}

fn check_count(idx: usize, assertion: &CompiledAssertion, observed: usize) -> Result<(), AssertionFailure> {
    let Some(bound) = &assertion.expected_count else {
        return Ok(());
    };
    let min_ok = bound.min.is_none_or(|min| observed as i64 >= min);
    let max_ok = bound.max.is_none_or(|max| observed as i64 <= max);
    if min_ok && max_ok {
        Ok(())
    } else {
        Err(AssertionFailure {
            assertion_index: idx,
            reason: format!(
                "expected_count not satisfied for '{}': observed {observed}, bound min={:?} max={:?}",
                assertion.entity, bound.min, bound.max
            ),
            observed: serde_json::json!({ "count": observed }),
        })
    }
}

fn check_changes(
    idx: usize,
    assertion: &CompiledAssertion,
    spec: &CompiledSpec,
    matched: &[&UpdatedRow],
    shape: Option<&TableShape>,
) -> Result<(), AssertionFailure> {
    if assertion.expected_changes.is_empty() && !spec.strict {
        return Ok(());
    }

    let masked_and_allowed: HashSet<&str> = spec
        .masks
        .iter()
        .map(String::as_str)
        .chain(assertion.local_ignore.iter().map(String::as_str))
        .chain(assertion.expected_changes.iter().map(|c| c.field.as_str()))
        .collect();

    for update in matched {
        let before = project(&update.before, shape);
        let after = project(&update.after, shape);

        for change in &assertion.expected_changes {
            if let Some(from) = &change.from {
                if !from.eval(&before) {
                    return Err(AssertionFailure {
                        assertion_index: idx,
                        reason: format!("field '{}' before-value did not satisfy 'from'", change.field),
                        observed: serde_json::json!({ "before": update.before.iter().map(|v| v.to_json()).collect::<Vec<_>>() }),
                    });
                }
            }
            if let Some(to) = &change.to {
                if !to.eval(&after) {
                    return Err(AssertionFailure {
                        assertion_index: idx,
                        reason: format!("field '{}' after-value did not satisfy 'to'", change.field),
                        observed: serde_json::json!({ "after": update.after.iter().map(|v| v.to_json()).collect::<Vec<_>>() }),
                    });
                }
            }
        }

        if spec.strict {
            let mask_applied: Vec<&String> = update
                .changed_fields
                .iter()
                .filter(|f| !spec.masks.contains(f))
                .collect();
            let extras: Vec<&&String> = mask_applied
                .iter()
                .filter(|f| !masked_and_allowed.contains(f.as_str()))
                .collect();
            if !extras.is_empty() {
                return Err(AssertionFailure {
                    assertion_index: idx,
                    reason: format!("unexpected changed fields in strict mode: {extras:?}"),
                    observed: serde_json::json!({ "changed_fields": update.changed_fields }),
                });
            }
        }
    }

    Ok(())
}
