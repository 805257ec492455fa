// Sprinkle some paranoia when printing network- or user-provided data
// to avoid messing up terminals remotely.
pub fn escape(data: &str) -> String {
    data.chars()
        .map(|char| char.escape_default().to_string())
        .collect()
}

/// Like `escape`, but keeps at most `max_chars` of the input. A whole SDP in
/// a log line helps nobody.
pub fn escape_abbrev(data: &str, max_chars: usize) -> String {
    let mut chars = data.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", escape(&head))
    } else {
        escape(&head)
    }
}
