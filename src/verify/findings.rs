//! Findings accumulator and the verification result.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub path: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Finding {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Shared by every check. Checks only ever add.
#[derive(Debug, Default)]
pub struct Findings {
    critical: Vec<Finding>,
    warnings: Vec<Finding>,
    notes: Vec<Finding>,
}

impl Findings {
    pub fn critical(&mut self, finding: Finding) {
        self.critical.push(finding);
    }

    pub fn warn(&mut self, finding: Finding) {
        self.warnings.push(finding);
    }

    pub fn note(&mut self, finding: Finding) {
        self.notes.push(finding);
    }

    pub fn into_result(self, checks: Vec<String>) -> VerificationResult {
        VerificationResult {
            success: self.critical.is_empty(),
            critical_errors: self.critical,
            warnings: self.warnings,
            notes: self.notes,
            checks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Exactly "no critical errors".
    pub success: bool,
    pub critical_errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub notes: Vec<Finding>,
    /// Names of the checks that ran, in order.
    pub checks: Vec<String>,
}

impl VerificationResult {
    /// Whether any critical error names `path`.
    pub fn has_critical_for(&self, path: &str) -> bool {
        self.critical_errors.iter().any(|f| f.path == path)
    }

    pub fn print(&self) {
        for f in &self.critical_errors {
            println!("  ✗ {}", f);
        }
        for f in &self.warnings {
            println!("  ⚠ {}", f);
        }
        for f in &self.notes {
            println!("  ○ {}", f);
        }
        if !self.critical_errors.is_empty() || !self.warnings.is_empty() || !self.notes.is_empty() {
            println!();
        }

        println!("Checks run: {}", self.checks.join(", "));
        println!(
            "Summary: {} critical, {} warnings, {} notes",
            self.critical_errors.len(),
            self.warnings.len(),
            self.notes.len()
        );
        if self.success {
            println!("✓ Image satisfies the rock-init contract");
        } else {
            println!("✗ Image will NOT boot: fix the critical errors above");
        }
    }
}
