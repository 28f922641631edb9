//! Markdown checklist parsing for the plan-tracking artifact.

use std::sync::LazyLock;

use regex::Regex;

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[([ xX])\]\s*(.*)$").expect("checkbox regex is valid")
});

/// Counts of checklist items in a plan document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanProgress {
    pub done: u32,
    pub pending: u32,
    /// Text of the pending items, in document order.
    pub pending_items: Vec<String>,
}

impl PlanProgress {
    pub fn total(&self) -> u32 {
        self.done + self.pending
    }

    pub fn has_pending(&self) -> bool {
        self.pending > 0
    }

    /// Fraction of items done, or `None` for a plan without checklist items.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| f64::from(self.done) / f64::from(total))
    }
}

/// Parse `- [ ]` / `- [x]` items (also `*`, `+` and numbered bullets).
///
/// Checkboxes inside fenced code blocks are ignored.
pub fn parse_plan(contents: &str) -> PlanProgress {
    let mut progress = PlanProgress::default();
    let mut in_fence = false;
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = CHECKBOX_RE.captures(line) else {
            continue;
        };
        if &caps[1] == " " {
            progress.pending += 1;
            progress.pending_items.push(caps[2].trim().to_string());
        } else {
            progress.done += 1;
        }
    }
    progress
}
