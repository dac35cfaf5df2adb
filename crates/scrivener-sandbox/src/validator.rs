//! Pre-execution validator for agent render code.
//!
//! This validator is **defense-in-depth**. The isolated frame is the real
//! security boundary; these textual checks catch common escape routes early and
//! report every violation at once so a generating agent can fix them in a single
//! retry.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Maximum render code size in characters.
pub const DEFAULT_MAX_CODE_SIZE: usize = 50_000;

/// Characters of context shown on each side of a banned match.
const SNIPPET_BEFORE: usize = 20;
const SNIPPET_AFTER: usize = 30;

static RENDER_DECL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bfunction\s+render\s*\(").unwrap());

/// A deny-list entry: a label for error messages and the pattern it matches.
struct BannedPattern {
    label: &'static str,
    re: Regex,
}

static BANNED_PATTERNS: LazyLock<Vec<BannedPattern>> = LazyLock::new(|| {
    [
        // dynamic code evaluation
        ("eval", r"\beval\s*\("),
        ("Function constructor", r"\bnew\s+Function\b|\bFunction\s*\("),
        ("dynamic import", r"\bimport\s*\("),
        // network
        ("fetch", r"\bfetch\s*\("),
        ("XMLHttpRequest", r"\bXMLHttpRequest\b"),
        ("WebSocket", r"\bWebSocket\b"),
        // background execution
        ("Worker", r"\b(?:Shared|Service)?Worker\b"),
        ("SharedArrayBuffer", r"\bSharedArrayBuffer\b"),
        ("postMessage", r"\bpostMessage\b"),
        ("setTimeout", r"\bsetTimeout\b"),
        ("setInterval", r"\bsetInterval\b"),
        // client storage
        ("localStorage", r"\blocalStorage\b"),
        ("sessionStorage", r"\bsessionStorage\b"),
        ("indexedDB", r"\bindexedDB\b"),
        ("document.cookie", r"\bdocument\s*\.\s*cookie\b"),
        // frame escape
        ("window.top", r"\bwindow\s*\.\s*top\b"),
        ("window.parent", r"\bwindow\s*\.\s*parent\b"),
        // handler injection through markup or attributes
        ("inline event handler", r"(?i)<[a-z][^>]*\son[a-z]+\s*="),
        (
            "setAttribute on* handler",
            r#"(?i)\.setAttribute\s*\(\s*['"`]on[a-z]+"#,
        ),
    ]
    .into_iter()
    .map(|(label, pattern)| BannedPattern {
        label,
        re: Regex::new(pattern).unwrap(),
    })
    .collect()
});

/// Result of a static check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// `true` only when `errors` is empty.
    pub ok: bool,
    /// Every violation found, in check order.
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }
}

/// A static gate run before any code reaches a frame.
pub trait StaticCheck: Send + Sync {
    /// Inspect `code` without executing it.
    fn check(&self, code: &str) -> ValidationReport;
}

/// Regex deny-list validator.
#[derive(Debug, Clone)]
pub struct PatternValidator {
    /// Size ceiling in characters.
    pub max_code_size: usize,
}

impl Default for PatternValidator {
    fn default() -> Self {
        Self {
            max_code_size: DEFAULT_MAX_CODE_SIZE,
        }
    }
}

impl PatternValidator {
    /// Create a validator with a custom size ceiling.
    pub fn new(max_code_size: usize) -> Self {
        Self { max_code_size }
    }
}

impl StaticCheck for PatternValidator {
    fn check(&self, code: &str) -> ValidationReport {
        if code.trim().is_empty() {
            return ValidationReport::from_errors(vec!["Empty render_code".into()]);
        }

        let mut errors = Vec::new();

        let chars = code.chars().count();
        if chars > self.max_code_size {
            errors.push(format!(
                "Code too large ({chars} characters, max {})",
                self.max_code_size
            ));
        }

        if !RENDER_DECL_RE.is_match(code) {
            errors.push("Missing function render(...) definition".into());
        }

        for banned in BANNED_PATTERNS.iter() {
            if let Some(m) = banned.re.find(code) {
                errors.push(format!(
                    "Banned pattern ({}) near \"{}\"",
                    banned.label,
                    snippet_around(code, m.start(), m.end())
                ));
            }
        }

        ValidationReport::from_errors(errors)
    }
}

/// Validate render code with the default size ceiling.
pub fn validate(code: &str) -> ValidationReport {
    PatternValidator::default().check(code)
}

/// Roughly 50 characters around a match, whitespace collapsed.
fn snippet_around(code: &str, start: usize, end: usize) -> String {
    let before: Vec<char> = code[..start].chars().rev().take(SNIPPET_BEFORE).collect();
    let matched_and_after: String = code[start..]
        .chars()
        .take(SNIPPET_AFTER.max(code[start..end].chars().count()))
        .collect();
    let raw: String = before.into_iter().rev().chain(matched_and_after.chars()).collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
