use super::{ExecContext, RecordStream};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::{Expression, Scope};
use crate::value::{Redaction, Value};

/// `$redact`: decide per document level whether to keep, prune, or descend.
pub(crate) fn redact<'a>(
    expr: &'a Expression,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    Box::new(input.filter_map(move |item| {
        item.and_then(|doc| redact_level(expr, &doc, &doc, &ctx))
            .transpose()
    }))
}

/// Only the system variables count; a string that merely reads
/// `"$$KEEP"` is rejected like any other value.
fn decide(
    expr: &Expression,
    root: &Document,
    current: &Document,
    ctx: &ExecContext<'_>,
) -> Result<Redaction> {
    let scope = Scope::new(root, &ctx.vars).with_current(current);
    match expr.evaluate_in(&scope)? {
        Value::Redaction(decision) => Ok(decision),
        other => Err(Error::InvalidSpec(format!(
            "$redact must resolve to $$KEEP, $$PRUNE or $$DESCEND, found {other}"
        ))),
    }
}

fn redact_level(
    expr: &Expression,
    root: &Document,
    current: &Document,
    ctx: &ExecContext<'_>,
) -> Result<Option<Document>> {
    match decide(expr, root, current, ctx)? {
        Redaction::Keep => Ok(Some(current.clone())),
        Redaction::Prune => Ok(None),
        Redaction::Descend => {
            let mut out = Document::new();
            for (name, value) in current.iter() {
                let kept = match value {
                    Value::Document(sub) => match redact_level(expr, root, sub, ctx)? {
                        Some(doc) => Value::Document(doc),
                        None => continue,
                    },
                    Value::Array(items) => Value::Array(redact_array(expr, root, items, ctx)?),
                    other => other.clone(),
                };
                out.insert(name, kept);
            }
            Ok(Some(out))
        }
    }
}

fn redact_array(
    expr: &Expression,
    root: &Document,
    items: &[Value],
    ctx: &ExecContext<'_>,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Document(sub) => {
                if let Some(doc) = redact_level(expr, root, sub, ctx)? {
                    out.push(Value::Document(doc));
                }
            }
            Value::Array(inner) => out.push(Value::Array(redact_array(expr, root, inner, ctx)?)),
            other => out.push(other.clone()),
        }
    }
    Ok(out)
}
