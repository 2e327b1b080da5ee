use super::{ExecContext, RecordStream};
use crate::query::Filter;

/// `$match`: keep records satisfying the filter.
pub(crate) fn filter<'a>(
    filter: &'a Filter,
    input: RecordStream<'a>,
    ctx: ExecContext<'a>,
) -> RecordStream<'a> {
    Box::new(input.filter_map(move |item| {
        let doc = match item {
            Ok(doc) => doc,
            Err(e) => return Some(Err(e)),
        };
        match filter.matches_in(&ctx.scope(&doc)) {
            Ok(true) => Some(Ok(doc)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }))
}
