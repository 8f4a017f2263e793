use std::fs;

use crate::il::SequencePoint;

/// Source lines around a sequence point, numbered, with the mutated range
/// marked. `None` when the document cannot be read (missing checkout, moved
/// file) — callers print a "source unavailable" notice instead.
pub fn source_excerpt(sp: &SequencePoint, context: usize) -> Option<String> {
    let contents = fs::read_to_string(&sp.document).ok()?;
    let lines: Vec<&str> = contents.lines().collect();

    let start_line = sp.start_line as usize;
    let end_line = sp.end_line as usize;
    if start_line == 0 || start_line > lines.len() {
        return None;
    }

    let first = (start_line - 1).saturating_sub(context);
    let last = usize::min(end_line + context, lines.len());

    let mut out = String::new();
    for (i, line) in lines[first..last].iter().enumerate() {
        let number = first + i + 1;
        let marker = if number >= start_line && number <= end_line {
            '>'
        } else {
            ' '
        };
        out.push_str(&format!("{marker} {number:>4} | {line}\n"));
    }
    Some(out)
}
