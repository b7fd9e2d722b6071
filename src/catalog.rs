//! Product catalog and matching of recognized text against it.
//!
//! Matching order:
//! 1. Exact: the catalog name appears as a contiguous token sequence in the
//!    text. The longest (most specific) name wins.
//! 2. Fuzzy: normalized Levenshtein similarity of the best candidate, accepted
//!    only above `min_similarity`.
//!
//! Fuzzy never overrides an exact match and never guesses below the threshold.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::text;

pub const DEFAULT_MIN_SIMILARITY: f32 = 0.75;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CatalogMatch {
    pub product_id: String,
    pub product_name: String,
    pub kind: MatchKind,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct Catalog {
    entries: Vec<Entry>,
    min_similarity: f32,
}

#[derive(Clone, Debug)]
struct Entry {
    product: Product,
    tokens: Vec<String>,
    joined: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        let entries = products
            .into_iter()
            .filter_map(|product| {
                let joined = text::clean(&product.name);
                if joined.is_empty() {
                    return None;
                }
                let tokens = joined.split(' ').map(str::to_string).collect();
                Some(Entry {
                    product,
                    tokens,
                    joined,
                })
            })
            .collect();
        Self {
            entries,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    /// Load `{"products": [{"id": .., "name": ..}, ..]}` from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid catalog {}: {}", path.display(), e))?;
        Ok(Self::new(file.products))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match cleaned/normalized text (see `text::prepare`).
    pub fn match_text(&self, normalized: &str) -> Option<CatalogMatch> {
        if normalized.is_empty() || self.entries.is_empty() {
            return None;
        }
        self.exact(normalized).or_else(|| self.fuzzy(normalized))
    }

    fn exact(&self, normalized: &str) -> Option<CatalogMatch> {
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        let mut best: Option<&Entry> = None;
        for entry in &self.entries {
            if best.is_some_and(|b| entry.tokens.len() <= b.tokens.len()) {
                continue;
            }
            if contains_sequence(&tokens, &entry.tokens) {
                best = Some(entry);
            }
        }
        best.map(|entry| CatalogMatch {
            product_id: entry.product.id.clone(),
            product_name: entry.product.name.clone(),
            kind: MatchKind::Exact,
            score: 1.0,
        })
    }

    fn fuzzy(&self, normalized: &str) -> Option<CatalogMatch> {
        let mut best: Option<(&Entry, f32)> = None;
        for entry in &self.entries {
            let score = similarity(normalized, &entry.joined);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((entry, score));
            }
        }
        let (entry, score) = best?;
        if score < self.min_similarity {
            return None;
        }
        Some(CatalogMatch {
            product_id: entry.product.id.clone(),
            product_name: entry.product.name.clone(),
            kind: MatchKind::Fuzzy,
            score,
        })
    }
}

fn contains_sequence(haystack: &[&str], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| *a == b.as_str()))
}

fn similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / max_len as f32
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            Product {
                id: "p-neem".into(),
                name: "Neem Oil".into(),
            },
            Product {
                id: "p-neem-gold".into(),
                name: "Neem Oil Gold".into(),
            },
            Product {
                id: "p-manco".into(),
                name: "Mancozeb".into(),
            },
        ])
    }

    #[test]
    fn exact_prefers_most_specific_name() {
        let m = catalog().match_text("super neem oil gold 20 ec").unwrap();
        assert_eq!(m.product_id, "p-neem-gold");
        assert_eq!(m.kind, MatchKind::Exact);
    }

    #[test]
    fn fuzzy_accepts_close_misread() {
        let m = catalog().match_text("mancozeh").unwrap();
        assert_eq!(m.product_id, "p-manco");
        assert_eq!(m.kind, MatchKind::Fuzzy);
        assert!(m.score >= DEFAULT_MIN_SIMILARITY && m.score < 1.0);
    }

    #[test]
    fn unrelated_text_does_not_match() {
        assert!(catalog().match_text("fresh tomatoes").is_none());
        assert!(catalog().match_text("").is_none());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn loads_catalog_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"products": [{{"id": "p1", "name": "Copper Oxychloride"}}]}}"#
        )?;
        let catalog = Catalog::load(file.path())?;
        assert_eq!(catalog.len(), 1);
        assert!(catalog.match_text("copper oxychloride 50 wp").is_some());
        Ok(())
    }
}
