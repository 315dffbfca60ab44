//! Completion status values shared by every token, cache and sequence

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Well-known status codes.
pub mod codes {
    /// Operation completed normally.
    pub const OK: i32 = 0;
    /// The service does not support the requested operation.
    pub const NOT_SUPPORTED: i32 = 10001;
    /// The handle or context passed to the service is not valid.
    pub const INVALID_HANDLE: i32 = 10002;
    /// The service or target is in a state that prevents the operation.
    pub const INVALID_STATE: i32 = 10003;
    /// The request could not be completed.
    pub const REQUEST_FAILED: i32 = 10004;
    /// Broken invariant or unexpected condition inside the framework.
    pub const INTERNAL_ERROR: i32 = 10005;
    /// The remote target reported an error.
    pub const TARGET_ERROR: i32 = 10006;
}

/// Severity of a [`Status`], ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Severity {
    #[default]
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

impl Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Ok => "ok",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Outcome of an asynchronous operation.
///
/// A status is either a leaf (`children` empty) or a multi-status collecting the
/// statuses of several sub-operations. The severity of a multi-status is always the
/// maximum severity of itself and its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    severity: Severity,
    code: i32,
    message: String,
    children: Vec<Status>,
    multi: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl Status {
    /// Create a leaf status
    pub fn new<S: Into<String>>(severity: Severity, code: i32, message: S) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            children: Vec::new(),
            multi: false,
        }
    }

    /// The plain success status
    pub fn ok() -> Self {
        Self::new(Severity::Ok, codes::OK, "")
    }

    /// An informational leaf; still counts as success
    pub fn info<S: Into<String>>(code: i32, message: S) -> Self {
        Self::new(Severity::Info, code, message)
    }

    /// A warning leaf; does not fail sequences or transactions
    pub fn warning<S: Into<String>>(code: i32, message: S) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    /// An error leaf
    pub fn error<S: Into<String>>(code: i32, message: S) -> Self {
        Self::new(Severity::Error, code, message)
    }

    /// A cancel leaf, only valid on a canceled monitor
    pub fn cancel<S: Into<String>>(message: S) -> Self {
        Self::new(Severity::Cancel, codes::OK, message)
    }

    /// Create an empty multi-status. Its severity starts at `Ok` and grows as
    /// children are added.
    pub fn multi<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            severity: Severity::Ok,
            code,
            message: message.into(),
            children: Vec::new(),
            multi: true,
        }
    }

    /// Severity of the leaf, or the highest among the children
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// One of [`codes`] or a caller-defined code
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Human readable description
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Children of a multi-status, empty for a leaf
    pub fn children(&self) -> &[Status] {
        &self.children
    }

    /// Whether this status collects child statuses
    pub fn is_multi(&self) -> bool {
        self.multi
    }

    /// Severity is exactly `Ok`
    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    /// `true` for `Ok` and `Info`
    pub fn is_success(&self) -> bool {
        self.severity <= Severity::Info
    }

    /// `true` for `Error` and `Cancel`
    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }

    /// Whether the operation was canceled
    pub fn is_cancel(&self) -> bool {
        self.severity == Severity::Cancel
    }

    /// Add `status` as a single child, raising this status' severity if needed.
    ///
    /// Adding to a leaf status turns it into a multi-status whose first child is a
    /// copy of the original leaf.
    pub fn add(&mut self, status: Status) {
        if !self.multi {
            let replacement = Status::multi(self.code, self.message.clone());
            let original = std::mem::replace(self, replacement);
            if !original.is_ok() || !original.message.is_empty() {
                self.severity = original.severity;
                self.children.push(original);
            }
        }
        self.severity = self.severity.max(status.severity);
        self.children.push(status);
    }

    /// Merge `status` into this one: the children of a multi-status are added
    /// individually, a leaf status is added as one child.
    pub fn merge(&mut self, status: Status) {
        if status.multi {
            for child in status.children {
                self.add(child);
            }
        } else {
            self.add(status);
        }
    }

    /// Walk the status tree and return the first leaf with the highest severity.
    pub fn most_severe(&self) -> &Status {
        let mut best = self;
        for child in &self.children {
            let candidate = child.most_severe();
            if candidate.severity > best.severity || (best.multi && candidate.severity == best.severity) {
                best = candidate;
            }
        }
        best
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.severity, self.code, self.message)?;
        for child in &self.children {
            write!(f, "\n  {}", child)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Ok < Severity::Info);
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Cancel);
    }

    #[test]
    fn test_multi_status_takes_max_severity() {
        let mut multi = Status::multi(codes::OK, "collective");
        assert!(multi.is_ok());

        multi.add(Status::ok());
        multi.add(Status::warning(codes::REQUEST_FAILED, "partial"));
        assert_eq!(multi.severity(), Severity::Warning);

        multi.add(Status::error(codes::TARGET_ERROR, "boom"));
        assert_eq!(multi.severity(), Severity::Error);
        assert_eq!(multi.children().len(), 3);
        assert_eq!(multi.most_severe().message(), "boom");
    }

    #[test]
    fn test_merge_flattens_multi_status() {
        let mut inner = Status::multi(codes::OK, "inner");
        inner.add(Status::error(codes::REQUEST_FAILED, "a"));
        inner.add(Status::warning(codes::REQUEST_FAILED, "b"));

        let mut outer = Status::multi(codes::OK, "outer");
        outer.merge(inner);
        assert_eq!(outer.children().len(), 2);
        assert!(outer.is_error());
    }

    #[test]
    fn test_add_to_leaf_keeps_original() {
        let mut status = Status::error(codes::REQUEST_FAILED, "original");
        status.add(Status::error(codes::INTERNAL_ERROR, "rollback failed"));

        assert!(status.is_multi());
        assert_eq!(status.children().len(), 2);
        assert_eq!(status.children()[0].message(), "original");
        assert_eq!(status.most_severe().message(), "original");
    }

    #[test]
    fn test_success_predicates() {
        assert!(Status::ok().is_success());
        assert!(Status::info(1, "note").is_success());
        assert!(!Status::warning(1, "careful").is_success());
        assert!(Status::cancel("stop").is_cancel());
        assert!(Status::cancel("stop").is_error());
    }
}
