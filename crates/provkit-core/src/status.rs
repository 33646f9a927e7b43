use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Outcome severity, ordered so that merging two statuses keeps the
/// worse one. Cancellation outranks error for reporting purposes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated outcome of an engine run, a phase, or a single action.
/// Statuses form a tree: a phase status collects its action statuses,
/// the run status collects its phase statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    severity: Severity,
    message: String,
    #[serde(default)]
    children: Vec<Status>,
}

impl Status {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            children: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Severity::Ok, "ok")
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self::new(Severity::Ok, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn cancel(message: impl Into<String>) -> Self {
        Self::new(Severity::Cancel, message)
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn children(&self) -> &[Status] {
        &self.children
    }

    /// OK, INFO and WARNING all count as a successful outcome.
    pub fn is_ok(&self) -> bool {
        self.severity <= Severity::Warning
    }

    pub fn is_canceled(&self) -> bool {
        self.severity == Severity::Cancel
    }

    /// Attach a child and raise this status' severity to the worse of
    /// the two. The parent message is kept.
    pub fn merge(&mut self, child: Status) {
        if child.severity > self.severity {
            self.severity = child.severity;
        }
        self.children.push(child);
    }

    /// Collapse an aggregate holding exactly one child into that child,
    /// preserving caller-relevant detail. Anything else is returned
    /// unchanged.
    pub fn flatten(self) -> Self {
        if self.children.len() == 1 {
            let mut children = self.children;
            return children.remove(0);
        }
        self
    }

    /// Boundary helper for hosts that want `Result` semantics: OK-ish
    /// statuses pass through, ERROR/CANCEL become an error carrying the
    /// rendered status tree.
    pub fn into_result(self) -> Result<Status> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(anyhow!("{self}"))
    }

    fn render(&self, indent: usize, out: &mut String) {
        for _ in 0..indent {
            out.push_str("  ");
        }
        out.push_str(&format!("[{}] {}", self.severity, self.message));
        for child in &self.children {
            out.push('\n');
            child.render(indent + 1, out);
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(0, &mut out);
        f.write_str(&out)
    }
}
