//! OCR text post-processing.
//!
//! Raw recognizer output is noisy (mixed case, punctuation, line breaks,
//! letters split by spacing). `clean` makes it a stable lowercase ASCII form,
//! `normalize` repairs tokenization. Both are deterministic and idempotent.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn non_alnum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// Lowercase, replace everything but `[a-z0-9]` with spaces, collapse and trim.
///
/// Digits are kept so strengths like "20 wg" survive.
pub fn clean(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let lowered = raw.to_lowercase();
    let replaced = non_alnum().replace_all(&lowered, " ");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Merge runs of isolated letters ("n e e m" -> "neem"), drop leftover
/// single letters and repeated tokens, keep first-seen order.
pub fn normalize(cleaned: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = String::new();

    for token in cleaned.split(' ').filter(|t| !t.is_empty()) {
        if is_single_letter(token) {
            merged.push_str(token);
            continue;
        }
        flush(&mut merged, &mut out, &mut seen);
        push_token(token, &mut out, &mut seen);
    }
    flush(&mut merged, &mut out, &mut seen);

    out.join(" ")
}

/// `normalize(clean(raw))`.
pub fn prepare(raw: &str) -> String {
    normalize(&clean(raw))
}

fn is_single_letter(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic())
}

fn flush(merged: &mut String, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    if merged.is_empty() {
        return;
    }
    let token = std::mem::take(merged);
    push_token(&token, out, seen);
}

fn push_token(token: &str, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    if is_single_letter(token) {
        return;
    }
    if seen.insert(token.to_string()) {
        out.push(token.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_symbols_and_case() {
        assert_eq!(clean("  Neem-Oil 20%\nEC!! "), "neem oil 20 ec");
        assert_eq!(clean(""), "");
        assert_eq!(clean("***"), "");
    }

    #[test]
    fn clean_is_idempotent() {
        let once = clean("Mancozeb 75% WP");
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn normalize_merges_spaced_letters() {
        assert_eq!(normalize("n e e m oil"), "neem oil");
    }

    #[test]
    fn normalize_drops_stray_letters_and_duplicates() {
        assert_eq!(normalize("oil x 20 oil"), "oil 20");
        assert_eq!(normalize("a"), "");
    }

    #[test]
    fn normalize_keeps_single_digits() {
        assert_eq!(normalize("grade 5 mix"), "grade 5 mix");
    }

    #[test]
    fn prepare_chains_both_steps() {
        assert_eq!(prepare("T O M A T O  Paste"), "tomato paste");
    }
}
