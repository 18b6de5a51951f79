//! Deterministic obligation-date extraction.
//!
//! Scans subject + snippet for explicit calendar dates: ISO dates, month-name
//! dates ("Jan 15", "January 15, 2026"), and numeric M/D forms. Year-less
//! dates resolve to the next occurrence on or after the received date.
//! Weekday-only references ("this Friday") are deliberately not resolved —
//! those stay ambiguous and surface as date-less obligations.

use chrono::{Datelike, NaiveDate};

fn month_from_token(token: &str) -> Option<u32> {
    let token = token.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
    let month = match token.as_str() {
        "jan" | "january" => 1,
        "feb" | "february" => 2,
        "mar" | "march" => 3,
        "apr" | "april" => 4,
        "may" => 5,
        "jun" | "june" => 6,
        "jul" | "july" => 7,
        "aug" | "august" => 8,
        "sep" | "sept" | "september" => 9,
        "oct" | "october" => 10,
        "nov" | "november" => 11,
        "dec" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

fn day_from_token(token: &str) -> Option<u32> {
    let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
    let digits: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() || digits.len() != trimmed.len() {
        // Reject tokens like "15th" only when the suffix isn't ordinal
        let rest = &trimmed[digits.len()..];
        if !matches!(rest.to_lowercase().as_str(), "st" | "nd" | "rd" | "th") {
            return None;
        }
    }
    let day: u32 = digits.parse().ok()?;
    (1..=31).contains(&day).then_some(day)
}

fn year_from_token(token: &str) -> Option<i32> {
    let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
    if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = trimmed.parse().ok()?;
    (1970..=2100).contains(&year).then_some(year)
}

/// Resolve a month/day with no year to the next occurrence on or after
/// `received`.
fn resolve_year(month: u32, day: u32, received: NaiveDate) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(received.year(), month, day);
    match this_year {
        Some(date) if date >= received => Some(date),
        _ => NaiveDate::from_ymd_opt(received.year() + 1, month, day),
    }
}

fn parse_iso_token(token: &str) -> Option<NaiveDate> {
    let trimmed = token.trim_matches(|c: char| !(c.is_ascii_digit() || c == '-'));
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .filter(|d| d.year() >= 1970)
}

fn parse_slash_token(token: &str, received: NaiveDate) -> Option<NaiveDate> {
    let trimmed = token.trim_matches(|c: char| !(c.is_ascii_digit() || c == '/'));
    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.as_slice() {
        [m, d] => {
            let month: u32 = m.parse().ok()?;
            let day: u32 = d.parse().ok()?;
            if !(1..=12).contains(&month) {
                return None;
            }
            resolve_year(month, day, received)
        }
        [m, d, y] => {
            let month: u32 = m.parse().ok()?;
            let day: u32 = d.parse().ok()?;
            let year: i32 = y.parse().ok()?;
            let year = if year < 100 { 2000 + year } else { year };
            NaiveDate::from_ymd_opt(year, month, day)
        }
        _ => None,
    }
}

/// Extract the first explicit date from `text`, received on `received`.
pub fn extract_date(text: &str, received: NaiveDate) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        if let Some(date) = parse_iso_token(token) {
            return Some(date);
        }
        if token.contains('/') {
            if let Some(date) = parse_slash_token(token, received) {
                return Some(date);
            }
        }
        if let Some(month) = month_from_token(token) {
            if let Some(day_token) = tokens.get(i + 1) {
                if let Some(day) = day_from_token(day_token) {
                    // "January 15, 2026" — an explicit year wins over resolution
                    if let Some(year) = tokens.get(i + 2).and_then(|t| year_from_token(t)) {
                        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                            return Some(date);
                        }
                    }
                    return resolve_year(month, day, received);
                }
            }
        }
    }

    None
}
