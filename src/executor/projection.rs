use super::{ExecContext, RecordStream, map_records};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::stage::{ProjectField, Projection};
use crate::value::Value;

/// `$project` in inclusion or exclusion mode.
pub(crate) fn project<'a>(
    projection: &'a Projection,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    map_records(input, move |doc| {
        if projection.exclusion {
            return Ok(exclude(doc, projection));
        }
        include(&doc, projection, &ctx)
    })
}

fn exclude(mut doc: Document, projection: &Projection) -> Document {
    if projection.exclude_id {
        doc.remove("_id");
    }
    for (path, _) in &projection.fields {
        doc.remove_path(path);
    }
    doc
}

fn include(doc: &Document, projection: &Projection, ctx: &ExecContext<'_>) -> Result<Document> {
    let mut out = Document::new();
    if !projection.exclude_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    let scope = ctx.scope(doc);
    for (path, field) in &projection.fields {
        match field {
            ProjectField::Include => {
                let (head, rest) = match path.split_once('.') {
                    Some((head, rest)) => (head, Some(rest)),
                    None => (path.as_str(), None),
                };
                let Some(value) = doc.get(head) else { continue };
                let picked = match rest {
                    None => Some(value.clone()),
                    Some(rest) => pick(value, rest),
                };
                if let Some(picked) = picked {
                    merge_into(&mut out, head, picked);
                }
            }
            ProjectField::Compute(expr) => {
                let value = expr.evaluate_in(&scope)?;
                if !value.is_missing() {
                    out.set_path(path, value);
                }
            }
            ProjectField::Exclude => {}
        }
    }
    Ok(out)
}

/// Keep only `path` inside `value`. Arrays keep the projection of each
/// document element.
fn pick(value: &Value, path: &str) -> Option<Value> {
    match value {
        Value::Document(doc) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let inner = doc.get(head)?;
            let picked = match rest {
                None => inner.clone(),
                Some(rest) => pick(inner, rest)?,
            };
            let mut out = Document::new();
            out.insert(head, picked);
            Some(Value::Document(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| matches!(item, Value::Document(_)))
                .map(|item| pick(item, path).unwrap_or_else(|| Value::Document(Document::new())))
                .collect(),
        )),
        _ => None,
    }
}

fn merge_into(out: &mut Document, key: &str, value: Value) {
    let value = match (out.get_mut(key), value) {
        (Some(Value::Document(existing)), Value::Document(incoming)) => {
            for (k, v) in incoming {
                merge_into(existing, &k, v);
            }
            return;
        }
        (Some(Value::Array(existing)), Value::Array(incoming))
            if existing.len() == incoming.len() =>
        {
            for (slot, v) in existing.iter_mut().zip(incoming) {
                if let (Value::Document(a), Value::Document(b)) = (slot, v) {
                    for (k, v) in b {
                        merge_into(a, &k, v);
                    }
                }
            }
            return;
        }
        (_, value) => value,
    };
    out.insert(key, value);
}

/// `$addFields` / `$set`: every expression sees the incoming record.
pub(crate) fn add_fields<'a>(
    fields: &'a [(String, Expression)],
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    map_records(input, move |mut doc| {
        let values = {
            let scope = ctx.scope(&doc);
            fields
                .iter()
                .map(|(_, expr)| expr.evaluate_in(&scope))
                .collect::<Result<Vec<_>>>()?
        };
        for ((path, _), value) in fields.iter().zip(values) {
            if value.is_missing() {
                doc.remove_path(path);
            } else {
                doc.set_path(path, value);
            }
        }
        Ok(doc)
    })
}

pub(crate) fn unset<'a>(paths: &'a [String], input: RecordStream<'a>) -> RecordStream<'a> {
    map_records(input, move |mut doc| {
        for path in paths {
            doc.remove_path(path);
        }
        Ok(doc)
    })
}

/// `$replaceRoot` / `$replaceWith`.
pub(crate) fn replace_root<'a>(
    expr: &'a Expression,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    map_records(input, move |doc| match expr.evaluate_in(&ctx.scope(&doc))? {
        Value::Document(root) => Ok(root),
        other => Err(Error::TypeMismatch(format!(
            "replacement root must be a document, found {}",
            other.type_name()
        ))),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::Error;
    use crate::executor::test_support::run;

    #[test]
    fn inclusion_keeps_id_by_default() {
        let out = run(
            json!({"$project": {"name": 1, "missing": 1}}),
            json!([{"_id": 7, "name": "a", "secret": "s"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 7, "name": "a"}]));
    }

    #[test]
    fn inclusion_drops_id_when_asked() {
        let out = run(
            json!({"$project": {"_id": 0, "name": 1}}),
            json!([{"_id": 7, "name": "a"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"name": "a"}]));
    }

    #[test]
    fn computed_fields_and_missing_results() {
        let out = run(
            json!({"$project": {"total": {"$multiply": ["$price", "$qty"]}, "alias": "$nope"}}),
            json!([{"_id": 1, "price": 2, "qty": 3}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 1, "total": 6}]));
    }

    #[test]
    fn nested_inclusion_through_documents_and_arrays() {
        let out = run(
            json!({"$project": {"_id": 0, "user": {"name": 1}, "items.sku": 1, "user.age": 1}}),
            json!([{
                "user": {"name": "ann", "age": 30, "pw": "x"},
                "items": [{"sku": "a", "n": 1}, {"sku": "b", "n": 2}, 5]
            }]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([{"user": {"name": "ann", "age": 30}, "items": [{"sku": "a"}, {"sku": "b"}]}])
        );
    }

    #[test]
    fn exclusion_mode() {
        let out = run(
            json!({"$project": {"secret": 0, "meta.internal": 0}}),
            json!([{"_id": 1, "a": 1, "secret": 2, "meta": {"internal": 3, "public": 4}}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 1, "a": 1, "meta": {"public": 4}}]));

        let out = run(json!({"$project": {"_id": 0}}), json!([{"_id": 1, "a": 1}])).unwrap();
        assert_eq!(out, json!([{"a": 1}]));
    }

    #[test]
    fn add_fields_sees_original_record() {
        let out = run(
            json!({"$addFields": {"a": 10, "b": "$a", "c.d": {"$add": ["$a", 1]}}}),
            json!([{"a": 1}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"a": 10, "b": 1, "c": {"d": 2}}]));
    }

    #[test]
    fn set_with_remove_variable_drops_field() {
        let out = run(json!({"$set": {"gone": "$$REMOVE"}}), json!([{"gone": 1, "kept": 2}])).unwrap();
        assert_eq!(out, json!([{"kept": 2}]));
    }

    #[test]
    fn unset_fields() {
        let out = run(
            json!({"$unset": ["a", "b.c"]}),
            json!([{"a": 1, "b": {"c": 2, "d": 3}, "e": 4}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"b": {"d": 3}, "e": 4}]));
    }

    #[test]
    fn replace_root_requires_document() {
        let out = run(
            json!({"$replaceRoot": {"newRoot": "$inner"}}),
            json!([{"inner": {"x": 1}}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"x": 1}]));

        let out = run(
            json!({"$replaceWith": {"name": "$n", "twice": {"$multiply": ["$v", 2]}}}),
            json!([{"n": "a", "v": 4}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"name": "a", "twice": 8}]));

        let err = run(json!({"$replaceWith": "$inner"}), json!([{"inner": 3}])).unwrap_err();
        assert!(matches!(err.root(), Error::TypeMismatch(_)));
    }
}
