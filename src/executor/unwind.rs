use super::RecordStream;
use crate::document::Document;
use crate::error::Result;
use crate::stage::UnwindSpec;
use crate::value::Value;

/// `$unwind`: one output record per array element.
pub(crate) fn unwind<'a>(spec: &'a UnwindSpec, input: RecordStream<'a>) -> RecordStream<'a> {
    Box::new(input.flat_map(move |item| -> Vec<Result<Document>> {
        match item {
            Ok(doc) => unwind_one(spec, doc).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        }
    }))
}

fn with_index(mut doc: Document, spec: &UnwindSpec, index: Value) -> Document {
    if let Some(field) = &spec.include_array_index {
        doc.insert(field.clone(), index);
    }
    doc
}

fn unwind_one(spec: &UnwindSpec, doc: Document) -> Vec<Document> {
    let value = doc.get_path(&spec.path).cloned().unwrap_or(Value::Missing);
    match value {
        Value::Array(items) if !items.is_empty() => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let mut out = doc.clone();
                out.set_path(&spec.path, item);
                with_index(out, spec, Value::Int(i as i64))
            })
            .collect(),
        Value::Array(_) | Value::Null | Value::Missing => {
            if !spec.preserve_null_and_empty {
                return Vec::new();
            }
            let mut out = doc;
            out.set_path(&spec.path, Value::Null);
            vec![with_index(out, spec, Value::Null)]
        }
        // A scalar behaves like a one-element array.
        _ => vec![with_index(doc, spec, Value::Null)],
    }
}
