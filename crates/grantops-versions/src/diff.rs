//! Line-level comparison between two versions. Reporting only.

use std::fmt;

use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDiff {
    pub section: String,
    pub from: u32,
    pub to: u32,
    pub added: usize,
    pub removed: usize,
    /// Every line of both versions prefixed with `+`, `-` or a space.
    pub text: String,
}

impl SectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl fmt::Display for SectionDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--- {}-v{}\n+++ {}-v{}  (+{} -{})",
            self.section, self.from, self.section, self.to, self.added, self.removed
        )?;
        f.write_str(&self.text)
    }
}

/// Diff two texts line by line, returning `(added, removed, rendered)`.
pub fn diff_lines(old: &str, new: &str) -> (usize, usize, String) {
    let diff = TextDiff::from_lines(old, new);

    let mut added = 0;
    let mut removed = 0;
    let mut rendered = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => {
                removed += 1;
                "-"
            }
            ChangeTag::Insert => {
                added += 1;
                "+"
            }
            ChangeTag::Equal => " ",
        };
        rendered.push_str(sign);
        rendered.push_str(change.value());
        if change.missing_newline() {
            rendered.push('\n');
        }
    }
    (added, removed, rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_changed_lines() {
        let (added, removed, text) = diff_lines("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(added, 2);
        assert_eq!(removed, 1);
        assert_eq!(text, " a\n-b\n+B\n c\n+d\n");
    }

    #[test]
    fn identical_texts_have_no_changes() {
        let (added, removed, _) = diff_lines("same\n", "same\n");
        assert_eq!((added, removed), (0, 0));
    }

    #[test]
    fn missing_trailing_newline_still_renders_one_change_per_line() {
        let (_, _, text) = diff_lines("old", "new");
        assert_eq!(text, "-old\n+new\n");
    }
}
