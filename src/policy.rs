//! Safety policy for generated programs
//!
//! The policy is a syntactic deny-list evaluated over the program text,
//! plus a path-confinement rule that keeps every absolute path under the
//! single sanctioned input root:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Deny rules (all evaluated, never short-circuit)            │
//! │  - process / OS escape: os, sys, subprocess, spawn calls    │
//! │  - dynamic evaluation: eval, exec, __import__, importlib    │
//! │  - filesystem mutation: open, write, delete, archives       │
//! │  - arbitrary deserialisation: pickle, marshal, shelve, dill │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Path confinement                                           │
//! │  - absolute paths must be the input root or below it        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Matching over text both over- and under-blocks. It is not a security
//! boundary on its own; the execution host's isolation is.

use crate::extractor::CandidateCode;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PATH_RULE_ID: &str = "path-outside-input-root";
pub const DATA_PATH_RULE_ID: &str = "data-path-outside-input-root";

/// One matched deny rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub pattern_id: String,
    pub description: String,
}

impl Violation {
    pub fn new(pattern_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            description: description.into(),
        }
    }
}

/// Outcome of validating one program. `accepted` holds exactly when no
/// violation was collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    accepted: bool,
    violations: Vec<Violation>,
}

impl ValidationVerdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            accepted: violations.is_empty(),
            violations,
        }
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }

    /// True when a rule with this id was matched
    pub fn names(&self, pattern_id: &str) -> bool {
        self.violations.iter().any(|v| v.pattern_id == pattern_id)
    }
}

/// A program that passed the policy, ready for the runner.
///
/// Only [`SafetyPolicy::admit`] builds one, so a request always carries
/// validated code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    code: String,
    data_path: String,
}

impl ExecutionRequest {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn data_path(&self) -> &str {
        &self.data_path
    }
}

/// A single deny-list entry
#[derive(Debug, Clone)]
pub struct DenyRule {
    pub id: String,
    pub description: String,
    pattern: Regex,
}

impl DenyRule {
    fn builtin(id: &str, description: &str, pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            // builtin patterns are constants covered by tests
            pattern: Regex::new(&format!("(?i){}", pattern)).expect("builtin deny pattern"),
        }
    }

    /// Rule rejecting `import <module>` / `from <module> import`
    pub fn blocked_module(module: &str) -> Self {
        let escaped = regex::escape(module.trim());
        Self {
            id: format!("module:{}", module.trim()),
            description: format!("imports the blocked module '{}'", module.trim()),
            pattern: Regex::new(&format!(r"(?i)\b(?:import|from)\s+{}\b", escaped))
                .expect("escaped module pattern"),
        }
    }

    pub fn matches(&self, code: &str) -> bool {
        self.pattern.is_match(code)
    }
}

static DEFAULT_RULES: Lazy<Vec<DenyRule>> = Lazy::new(|| {
    vec![
        DenyRule::builtin(
            "os-import",
            "imports the operating-system interface module",
            r"\bimport\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*os\b|\bfrom\s+os\b",
        ),
        DenyRule::builtin(
            "sys-import",
            "imports the interpreter system module",
            r"\bimport\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*sys\b|\bfrom\s+sys\b",
        ),
        DenyRule::builtin(
            "subprocess",
            "uses the subprocess module",
            r"\bsubprocess\b",
        ),
        DenyRule::builtin(
            "process-spawn",
            "calls a process-spawning primitive",
            r"\b(?:popen\d?|system|fork|spawn[lv]p?e?|exec[lv]p?e?)\s*\(",
        ),
        DenyRule::builtin("eval", "calls eval()", r"\beval\s*\("),
        DenyRule::builtin("exec", "calls exec()", r"\bexec\s*\("),
        DenyRule::builtin(
            "dynamic-import",
            "imports modules reflectively",
            r"__import__|\bimportlib\b",
        ),
        DenyRule::builtin("open-call", "opens a file handle directly", r"\bopen\s*\("),
        DenyRule::builtin("write-call", "writes through a file-like object", r"\.write\s*\("),
        DenyRule::builtin(
            "delete-call",
            "removes filesystem entries",
            r"\.(?:remove|unlink|rmdir)\s*\(",
        ),
        DenyRule::builtin(
            "archive-module",
            "uses a bulk file or archive module",
            r"shutil|\bzipfile\b|\btarfile\b",
        ),
        DenyRule::builtin(
            "deserialization",
            "uses a module capable of arbitrary deserialisation",
            r"pickle|\bmarshal\b|\bshelve\b|\bdill\b",
        ),
    ]
});

// An absolute path starts right after whitespace, a quote, or an opening
// bracket/operator, so `a/b` and `x / y` are not paths.
static ABSOLUTE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s'"(\[{=,:<>+])(/[A-Za-z0-9_.][^\s'"()\[\]{},;]*)"#)
        .expect("absolute path pattern")
});

/// Deny-list validator bound to one input root
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    input_root: PathBuf,
    rules: Vec<DenyRule>,
}

impl SafetyPolicy {
    /// Default deny-list confined to `input_root`
    pub fn new(input_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            rules: DEFAULT_RULES.clone(),
        }
    }

    /// Extend the deny-list with module import bans
    pub fn with_blocked_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for module in modules {
            if !module.as_ref().trim().is_empty() {
                self.rules.push(DenyRule::blocked_module(module.as_ref()));
            }
        }
        self
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// Evaluate every rule and collect all violations. Never fails.
    pub fn validate(&self, code: &str) -> ValidationVerdict {
        let mut violations: Vec<Violation> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(code))
            .map(|rule| Violation::new(rule.id.clone(), rule.description.clone()))
            .collect();

        let mut seen = BTreeSet::new();
        for caps in ABSOLUTE_PATH.captures_iter(code) {
            let Some(path) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if !self.is_confined(path) && seen.insert(path.to_string()) {
                violations.push(Violation::new(
                    PATH_RULE_ID,
                    format!(
                        "references '{}' outside {}",
                        path,
                        self.input_root.display()
                    ),
                ));
            }
        }

        let verdict = ValidationVerdict::from_violations(violations);
        if verdict.accepted() {
            debug!("[POLICY] Code accepted");
        } else {
            let ids: Vec<&str> = verdict
                .violations()
                .iter()
                .map(|v| v.pattern_id.as_str())
                .collect();
            warn!("[POLICY] Code rejected: {:?}", ids);
        }
        verdict
    }

    /// Validate a candidate and, only if it is accepted, turn it into an
    /// execution request. The data path must also lie under the root.
    pub fn admit(
        &self,
        candidate: &CandidateCode,
        data_path: &str,
    ) -> std::result::Result<ExecutionRequest, ValidationVerdict> {
        let mut verdict = self.validate(&candidate.body);
        if !self.is_confined(data_path) {
            verdict.violations.push(Violation::new(
                DATA_PATH_RULE_ID,
                format!(
                    "data path '{}' is outside {}",
                    data_path,
                    self.input_root.display()
                ),
            ));
            verdict.accepted = false;
        }
        if !verdict.accepted() {
            return Err(verdict);
        }
        Ok(ExecutionRequest {
            code: candidate.body.clone(),
            data_path: data_path.to_string(),
        })
    }

    /// The root itself or anything below it, with no `..` escapes
    fn is_confined(&self, path: &str) -> bool {
        if path.split('/').any(|segment| segment == "..") {
            return false;
        }
        let root = self.input_root.to_string_lossy();
        let root = root.trim_end_matches('/');
        let path = path.trim_end_matches('/');
        if root.is_empty() {
            // root is "/"
            return true;
        }
        path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
    }
}
