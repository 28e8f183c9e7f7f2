//! Completion marker detection in executor output.

/// Wrap caller-chosen text in the completion sentinel.
pub fn promise_tag(text: &str) -> String {
    format!("<promise>{text}</promise>")
}

/// True if `output` contains the completion sentinel for `text`.
///
/// An empty promise never matches.
pub fn contains_promise(output: &str, text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    output.contains(&promise_tag(text))
}
