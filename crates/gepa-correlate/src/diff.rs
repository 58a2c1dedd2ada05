//! Per-role system prompt diffing
//!
//! The diff is a single forward two-pointer scan over lines, not an LCS.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Context,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: DiffKind,
    pub text: String,
}

impl DiffLine {
    fn new(kind: DiffKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
        }
    }
}

/// Line diff of `previous` → `current`.
///
/// Returns an empty list when nothing was added or removed.
pub fn diff_prompts(previous: &str, current: &str, max_lines: usize) -> Vec<DiffLine> {
    let old: Vec<&str> = previous.lines().collect();
    let new: Vec<&str> = current.lines().collect();

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            out.push(DiffLine::new(DiffKind::Context, old[i]));
            i += 1;
            j += 1;
        } else if !old[i..].contains(&new[j]) {
            out.push(DiffLine::new(DiffKind::Add, new[j]));
            j += 1;
        } else if !new[j..].contains(&old[i]) {
            out.push(DiffLine::new(DiffKind::Remove, old[i]));
            i += 1;
        } else {
            out.push(DiffLine::new(DiffKind::Remove, old[i]));
            out.push(DiffLine::new(DiffKind::Add, new[j]));
            i += 1;
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|l| DiffLine::new(DiffKind::Remove, l)));
    out.extend(new[j..].iter().map(|l| DiffLine::new(DiffKind::Add, l)));

    if out.iter().all(|l| l.kind == DiffKind::Context) {
        return Vec::new();
    }
    out.truncate(max_lines);
    out
}

/// Last system prompt seen per role, in chronological order
#[derive(Debug, Clone)]
pub struct PromptHistory {
    default_role: String,
    max_lines: usize,
    last_by_role: HashMap<String, String>,
}

impl PromptHistory {
    pub fn new(default_role: impl Into<String>, max_lines: usize) -> Self {
        Self {
            default_role: default_role.into(),
            max_lines,
            last_by_role: HashMap::new(),
        }
    }

    /// Record the next prompt of `role`, returning its diff against the previous one.
    ///
    /// `None` when there is no prompt or no predecessor to compare with.
    pub fn observe(&mut self, role: Option<&str>, prompt: Option<&str>) -> Option<Vec<DiffLine>> {
        let prompt = prompt?;
        let role = role.unwrap_or(&self.default_role).to_string();
        let diff = self
            .last_by_role
            .get(&role)
            .map(|previous| diff_prompts(previous, prompt, self.max_lines));
        self.last_by_role.insert(role, prompt.to_string());
        diff
    }
}
