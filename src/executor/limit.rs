use super::RecordStream;

/// `$limit`: stop pulling once `n` records have passed.
pub(crate) fn limit(n: u64, input: RecordStream<'_>) -> RecordStream<'_> {
    let n = usize::try_from(n).unwrap_or(usize::MAX);
    Box::new(input.take(n))
}

/// `$skip`: drop the first `n` records. Errors are never skipped.
pub(crate) fn skip(n: u64, input: RecordStream<'_>) -> RecordStream<'_> {
    let mut remaining = n;
    Box::new(input.filter(move |item| {
        if item.is_ok() && remaining > 0 {
            remaining -= 1;
            return false;
        }
        true
    }))
}
