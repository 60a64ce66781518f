//! Deterministic archive names for command output.

use lazy_static::lazy_static;
use regex::Regex;

use crate::constants::MAX_ARCHIVE_NAME_LEN;

lazy_static! {
    static ref BIN_PREFIX: Regex = Regex::new(r"^/(usr/)?s?bin/").unwrap();
    static ref UNSAFE_RUN: Regex = Regex::new(r"[^A-Za-z0-9_\-./]+").unwrap();
}

/// Derive a file name from a command line.
///
/// `/usr/sbin/lsof -i` becomes `lsof_-i`, `/usr/bin/cat /etc/hosts`
/// becomes `cat_.etc.hosts`. The result only contains `[A-Za-z0-9_.-]`,
/// never starts or ends with ` ._-`, and is at most 255 bytes.
pub fn mangle_command(command_line: &str) -> String {
    let without_prefix = BIN_PREFIX.replace(command_line, "");
    let safe = UNSAFE_RUN.replace_all(&without_prefix, "_");
    let dotted = safe.replace('/', ".");
    let trimmed = dotted.trim_matches(is_edge_char);

    // Only ASCII survives the substitution above, so byte slicing is safe
    let truncated = &trimmed[..trimmed.len().min(MAX_ARCHIVE_NAME_LEN)];
    truncated.trim_end_matches(is_edge_char).to_string()
}

fn is_edge_char(c: char) -> bool {
    matches!(c, ' ' | '.' | '_' | '-')
}
