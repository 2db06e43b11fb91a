use crate::model::*;

/// Spans during which the item cannot be claimed: active approved claims
/// plus every block on the current owner's calendar. Sorted and merged.
pub fn busy_spans(item: &ItemState, calendar: Option<&OwnerCalendar>) -> Vec<Span> {
    let mut spans: Vec<Span> = item.active_approved().map(|c| c.span).collect();
    if let Some(cal) = calendar {
        spans.extend(cal.blocks.values().map(|b| b.span));
    }
    spans.sort_by_key(|s| (s.start, s.end));
    merge_overlapping(&spans)
}

/// Merge sorted spans that overlap or touch.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and non-overlapping.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            if current_start >= b.end {
                break;
            }
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }
    result
}
