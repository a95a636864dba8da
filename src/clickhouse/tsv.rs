// ABOUTME: Parser for ClickHouse TabSeparated output
// ABOUTME: Splits rows and fields and reverses the format's escape sequences

use crate::endpoint::Rows;

/// Parse a TabSeparated response body into rows of unescaped fields
///
/// Literal tabs and newlines inside values are always escaped by the
/// server, so raw `\t` and `\n` are structural.
pub fn parse_rows(body: &str) -> Rows {
    body.split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(unescape).collect())
        .collect()
}

/// Reverse TabSeparated escaping for one field
pub fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse a numeric cell, treating `\N` (NULL) as absent
pub fn parse_u64(field: &str) -> Option<u64> {
    if field == "\\N" {
        return None;
    }
    field.trim().parse().ok()
}
