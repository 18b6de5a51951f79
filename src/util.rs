//! Small shared helpers: truncation, escaping, email parsing, atomic writes.

use std::io::Write;
use std::path::Path;

/// Truncate a string to at most `max` characters, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Minimal HTML escaping for digest excerpts.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Split an RFC 5322 `From` header into (display name, address).
///
/// "Jane Doe <jane@school.edu>" → ("Jane Doe", "jane@school.edu");
/// a bare address yields an empty name.
pub fn parse_from_header(from: &str) -> (String, String) {
    let from = from.trim();
    if let Some(open) = from.rfind('<') {
        if let Some(close) = from.rfind('>') {
            if close > open {
                let name = from[..open].trim().trim_matches('"').to_string();
                let email = from[open + 1..close].trim().to_string();
                return (name, email);
            }
        }
    }
    (String::new(), from.to_string())
}

/// Lowercased domain part of an email address, empty if none.
pub fn email_domain(email: &str) -> String {
    email
        .rsplit('@')
        .next()
        .filter(|d| *d != email)
        .unwrap_or("")
        .trim_end_matches('>')
        .to_lowercase()
}

/// Case-insensitive suffix-style domain match with `*` wildcard support.
///
/// "school.edu" matches "school.edu" and "mail.school.edu";
/// "*.edu" matches any .edu domain.
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_lowercase();
    let pattern = pattern.to_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    if pattern == "*" {
        return !domain.is_empty();
    }
    domain == pattern || domain.ends_with(&format!(".{pattern}"))
}

/// Write a file atomically: write to a sibling temp file, then rename.
pub fn atomic_write_str(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write")
    ));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
