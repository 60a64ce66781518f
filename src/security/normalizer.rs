//! Content normalization applied to every collected line.
//!
//! Masks credentials before anything reaches the staging tree. Expressions
//! come from a sed-style file (`s/regex/replacement/[g]` per line) when one
//! is installed, otherwise from a built-in table. The same table backs
//! [`scrub_credentials`], used for log and error output.

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::bytes;
use regex::Regex;
use std::borrow::Cow;
use std::path::Path;

const MASK: &str = "********";

lazy_static! {
    /// Built-in masking expressions: (pattern, replacement)
    static ref BUILTIN_PATTERNS: Vec<(&'static str, String)> = vec![
        // password=..., password: "...", password --md5 ..., password ...
        (r#"(?i)(password[a-zA-Z0-9_]*)(\s*:\s*"?\s*|\s*"?\s*=\s*"?\s*|\s*=+\s*|\s*--md5\s+|\s+)([a-zA-Z0-9_!@#$%^&*()+=/-]+)"#,
         format!("${{1}}${{2}}{}", MASK)),

        // secret / token / api key assignments
        (r#"(?i)(secret|token|api[_-]?key)([a-zA-Z0-9_]*\s*[:=]\s*"?)([^\s"]+)"#,
         format!("${{1}}${{2}}{}", MASK)),

        // credentials embedded in URLs
        (r"([a-zA-Z][a-zA-Z0-9+.-]*://)([^:/\s]+):([^@\s]+)@",
         format!("${{1}}${{2}}:{}@", MASK)),
    ];

    static ref BUILTIN_TEXT: Vec<(Regex, String)> = BUILTIN_PATTERNS
        .iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|re| (re, replacement.clone()))
        })
        .collect();
}

/// Mask credentials in a string before it is logged or displayed.
pub fn scrub_credentials(input: &str) -> String {
    let mut result = input.to_string();
    for (pattern, replacement) in BUILTIN_TEXT.iter() {
        result = pattern.replace_all(&result, replacement.as_str()).to_string();
    }
    result
}

#[derive(Debug, Clone)]
struct Expression {
    pattern: bytes::Regex,
    replacement: Vec<u8>,
    global: bool,
}

/// Line normalizer built from masking expressions.
#[derive(Debug, Clone)]
pub struct ContentNormalizer {
    expressions: Vec<Expression>,
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ContentNormalizer {
    /// The built-in credential masking table.
    pub fn builtin() -> Self {
        let expressions = BUILTIN_PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| {
                bytes::Regex::new(pattern).ok().map(|re| Expression {
                    pattern: re,
                    replacement: replacement.clone().into_bytes(),
                    global: true,
                })
            })
            .collect();
        Self { expressions }
    }

    /// A normalizer that leaves content untouched.
    pub fn passthrough() -> Self {
        Self {
            expressions: Vec::new(),
        }
    }

    /// Load expressions from a sed file, or fall back to the built-in table.
    pub fn load(sed_file: &Path) -> Self {
        if !sed_file.exists() {
            debug!("No sed file at {}, using built-in expressions", sed_file.display());
            return Self::builtin();
        }
        match std::fs::read_to_string(sed_file)
            .context(format!("Failed to read {}", sed_file.display()))
            .and_then(|text| Self::from_sed_script(&text))
        {
            Ok(normalizer) => normalizer,
            Err(e) => {
                warn!("{:#}; using built-in expressions", e);
                Self::builtin()
            }
        }
    }

    /// Parse a sed script. Blank lines and `#` comments are skipped; lines
    /// that are not substitutions are logged and ignored.
    pub fn from_sed_script(script: &str) -> Result<Self> {
        let mut expressions = Vec::new();
        for (lineno, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_substitution(line) {
                Ok(expr) => expressions.push(expr),
                Err(e) => warn!("Skipping sed expression on line {}: {}", lineno + 1, e),
            }
        }
        if expressions.is_empty() {
            bail!("No usable expressions in sed script");
        }
        Ok(Self { expressions })
    }

    pub fn is_passthrough(&self) -> bool {
        self.expressions.is_empty()
    }

    /// Apply every expression to one line (without its terminator).
    pub fn normalize<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]> {
        let mut current = Cow::Borrowed(line);
        for expr in &self.expressions {
            let replaced = if expr.global {
                expr.pattern.replace_all(&current, &expr.replacement[..])
            } else {
                expr.pattern.replace(&current, &expr.replacement[..])
            };
            if let Cow::Owned(changed) = replaced {
                current = Cow::Owned(changed);
            }
        }
        current
    }
}

fn split_unescaped(body: &str, delim: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == delim => parts.last_mut().map(|p| p.push(next)),
                Some(next) => parts.last_mut().map(|p| {
                    p.push('\\');
                    p.push(next);
                }),
                None => parts.last_mut().map(|p| p.push('\\')),
            };
        } else if c == delim {
            parts.push(String::new());
        } else if let Some(p) = parts.last_mut() {
            p.push(c);
        }
    }
    parts
}

/// Convert sed replacement syntax (`\1`, `&`) to regex syntax (`${1}`, `${0}`).
fn convert_replacement(sed: &str) -> String {
    let mut out = String::with_capacity(sed.len());
    let mut chars = sed.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(d) if d.is_ascii_digit() => out.push_str(&format!("${{{}}}", d)),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            '&' => out.push_str("${0}"),
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}

fn parse_substitution(line: &str) -> Result<Expression> {
    let mut chars = line.chars();
    if chars.next() != Some('s') {
        bail!("not a substitution: {}", line);
    }
    let delim = chars
        .next()
        .ok_or_else(|| anyhow!("missing delimiter: {}", line))?;
    let parts = split_unescaped(chars.as_str(), delim);
    if parts.len() != 3 {
        bail!("expected s{0}pattern{0}replacement{0}flags: {1}", delim, line);
    }
    let flags = parts[2].trim();
    let case_insensitive = flags.contains('I') || flags.contains('i');
    let pattern = if case_insensitive {
        format!("(?i){}", parts[0])
    } else {
        parts[0].clone()
    };
    let regex = bytes::Regex::new(&pattern)
        .map_err(|e| anyhow!("invalid pattern '{}': {}", parts[0], e))?;

    Ok(Expression {
        pattern: regex,
        replacement: convert_replacement(&parts[1]).into_bytes(),
        global: flags.contains('g'),
    })
}
