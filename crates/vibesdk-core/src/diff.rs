//! Unified-diff helper backing `FileState::last_diff`.

use similar::TextDiff;

/// Unified diff of `old` → `new` with conventional `a/`..`b/` headers.
/// A new file (empty `old`) produces a full-add diff.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_contents_produce_empty_diff() {
        assert_eq!(unified_diff("x.ts", "a\n", "a\n"), "");
    }

    #[test]
    fn new_file_produces_full_add_diff() {
        let diff = unified_diff("src/App.tsx", "", "line1\nline2\n");
        assert!(diff.contains("+line1"));
        assert!(diff.contains("+line2"));
        assert!(diff.contains("b/src/App.tsx"));
    }

    #[test]
    fn changed_line_shows_both_sides() {
        let diff = unified_diff("x.ts", "old line\n", "new line\n");
        assert!(diff.contains("-old line"));
        assert!(diff.contains("+new line"));
    }
}
