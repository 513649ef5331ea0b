//! Built-in validators.
//!
//! Line- and pattern-level checks over generated source. These are
//! deliberately interpreter-free: the authoritative verdict on behavior
//! comes from the sandboxed test run, these gates only reject source that
//! cannot possibly survive it.

use std::sync::LazyLock;

use regex::Regex;

use super::{Validator, ValidatorMessage, ValidatorOutcome};
use crate::fixes::PatchTransform;

static SELF_IMPORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:from\s+main\s+import\b|import\s+main\b)").unwrap());

static STDIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sys\.stdin|json\.load\s*\(\s*sys\.stdin|input\s*\(").unwrap()
});

static STDOUT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"print\s*\(|sys\.stdout|json\.dump\s*\(").unwrap());

/// Ambient-privilege calls generated code must not make.
const FORBIDDEN_CALLS: &[&str] = &[
    "subprocess",
    "os.system",
    "os.popen",
    "socket.",
    "eval(",
    "exec(",
    "__import__",
    "shutil.rmtree",
];

/// Rejects an artifact importing its own module (`from main import x`
/// inside `main.py`), which crashes at load time. Auto-fix drops the line.
pub struct SelfImportValidator;

impl Validator for SelfImportValidator {
    fn name(&self) -> &str {
        "self_import"
    }
    fn priority(&self) -> u32 {
        100
    }
    fn category(&self) -> &str {
        "imports"
    }
    fn supports_autofix(&self) -> bool {
        true
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        let offending: Vec<(usize, &str)> = source
            .lines()
            .enumerate()
            .filter(|(_, l)| SELF_IMPORT_PATTERN.is_match(l))
            .collect();
        if offending.is_empty() {
            return ValidatorOutcome::pass();
        }
        let messages = offending
            .iter()
            .map(|(idx, line)| {
                ValidatorMessage::new(
                    Some(idx + 1),
                    "circular_self_import",
                    format!("artifact imports its own module: `{}`", line.trim()),
                )
            })
            .collect();
        // Dropping the import is safe: the named symbols are defined in
        // the same file.
        let needle = if source.contains("from main import") {
            "from main import"
        } else {
            "import main"
        };
        ValidatorOutcome::fail_with_fix(
            messages,
            PatchTransform::DropLines {
                containing: needle.to_string(),
            },
        )
    }
}

/// Bracket and string-literal balance scan.
pub struct SyntaxBalanceValidator;

impl Validator for SyntaxBalanceValidator {
    fn name(&self) -> &str {
        "syntax_balance"
    }
    fn priority(&self) -> u32 {
        90
    }
    fn category(&self) -> &str {
        "syntax"
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        match scan_balance(source) {
            Ok(()) => ValidatorOutcome::pass(),
            Err(msg) => ValidatorOutcome::fail(vec![msg]),
        }
    }
}

/// Requires the stdin-JSON-in / stdout-JSON-out shape every executable
/// artifact must follow.
pub struct IoContractValidator;

impl Validator for IoContractValidator {
    fn name(&self) -> &str {
        "io_contract"
    }
    fn priority(&self) -> u32 {
        80
    }
    fn category(&self) -> &str {
        "contract"
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        let mut messages = Vec::new();
        if !STDIN_PATTERN.is_match(source) {
            messages.push(ValidatorMessage::new(
                None,
                "no_stdin_read",
                "artifact never reads the JSON input document from stdin",
            ));
        }
        if !STDOUT_PATTERN.is_match(source) {
            messages.push(ValidatorMessage::new(
                None,
                "no_stdout_write",
                "artifact never writes a JSON document to stdout",
            ));
        }
        if messages.is_empty() {
            ValidatorOutcome::pass()
        } else {
            ValidatorOutcome::fail(messages)
        }
    }
}

/// Rejects calls that reach outside the sandbox.
pub struct ForbiddenCallValidator;

impl Validator for ForbiddenCallValidator {
    fn name(&self) -> &str {
        "forbidden_call"
    }
    fn priority(&self) -> u32 {
        70
    }
    fn category(&self) -> &str {
        "safety"
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        let mut messages = Vec::new();
        for (idx, line) in source.lines().enumerate() {
            let code = strip_comment(line);
            for needle in FORBIDDEN_CALLS {
                if code.contains(needle) {
                    messages.push(ValidatorMessage::new(
                        Some(idx + 1),
                        "forbidden_call",
                        format!("`{needle}` is not available inside the sandbox"),
                    ));
                }
            }
        }
        if messages.is_empty() {
            ValidatorOutcome::pass()
        } else {
            ValidatorOutcome::fail(messages)
        }
    }
}

/// Byte-size cap on generated source.
pub struct SourceSizeValidator {
    pub max_bytes: usize,
}

impl Default for SourceSizeValidator {
    fn default() -> Self {
        Self { max_bytes: 65_536 }
    }
}

impl Validator for SourceSizeValidator {
    fn name(&self) -> &str {
        "source_size"
    }
    fn priority(&self) -> u32 {
        60
    }
    fn category(&self) -> &str {
        "size"
    }
    fn check(&self, source: &str) -> ValidatorOutcome {
        if source.len() <= self.max_bytes {
            ValidatorOutcome::pass()
        } else {
            ValidatorOutcome::fail(vec![ValidatorMessage::new(
                None,
                "source_too_large",
                format!("{} bytes exceeds the {} byte cap", source.len(), self.max_bytes),
            )])
        }
    }
}

/// All built-in validators under their default priorities.
pub fn builtin_validators() -> Vec<Box<dyn Validator>> {
    vec![
        Box::new(SelfImportValidator),
        Box::new(SyntaxBalanceValidator),
        Box::new(IoContractValidator),
        Box::new(ForbiddenCallValidator),
        Box::new(SourceSizeValidator::default()),
    ]
}

fn strip_comment(line: &str) -> &str {
    // Good enough for safety scanning: a '#' inside a string literal may
    // hide the tail of the line, which only makes the check stricter.
    line.split('#').next().unwrap_or(line)
}

/// Scan for bracket balance, honoring string literals (single, double,
/// and triple quotes) and `#` comments.
fn scan_balance(source: &str) -> Result<(), ValidatorMessage> {
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut string_delim: Option<(char, bool)> = None; // (quote char, triple)
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
        }

        if let Some((delim, triple)) = string_delim {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == delim {
                if triple {
                    if i + 2 < chars.len() && chars[i + 1] == delim && chars[i + 2] == delim {
                        string_delim = None;
                        i += 3;
                        continue;
                    }
                } else {
                    string_delim = None;
                }
            } else if !triple && c == '\n' {
                // Unterminated single-line string.
                return Err(ValidatorMessage::new(
                    Some(line - 1),
                    "unterminated_string",
                    "string literal is not closed before end of line",
                ));
            }
            i += 1;
            continue;
        }

        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let triple =
                    i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                string_delim = Some((c, triple));
                i += if triple { 3 } else { 1 };
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        return Err(ValidatorMessage::new(
                            Some(line),
                            "unbalanced_bracket",
                            format!("unmatched closing `{c}`"),
                        ))
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some((open, open_line)) = stack.pop() {
        return Err(ValidatorMessage::new(
            Some(open_line),
            "unbalanced_bracket",
            format!("`{open}` is never closed"),
        ));
    }
    if string_delim.is_some() {
        return Err(ValidatorMessage::new(
            Some(line),
            "unterminated_string",
            "string literal is not closed before end of file",
        ));
    }
    Ok(())
}
