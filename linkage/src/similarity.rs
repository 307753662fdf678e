//! Field comparison primitives.
//!
//! Pure functions with no state. Every string similarity returns a value in
//! `[0, 1]`; cosine similarity returns `[-1, 1]`. [`Comparator`] selects one
//! of them per field and applies it to two [`FieldValue`]s.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::FieldValue;

/// Casefold and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Keep ASCII digits only. Used for phone-like keys.
pub fn digits_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// 1.0 when the normalized strings are equal, else 0.0.
pub fn exact(a: &str, b: &str) -> f64 {
    if normalize(a) == normalize(b) { 1.0 } else { 0.0 }
}

/// Levenshtein distance normalized to a similarity in `[0, 1]`.
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

/// Jaro-Winkler similarity on normalized input.
pub fn jaro_winkler_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(&normalize(a), &normalize(b))
}

/// Jaccard overlap of whitespace-delimited tokens.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    let left: HashSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let right: HashSet<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    jaccard(&left, &right)
}

/// Character n-grams of the normalized string.
///
/// Strings shorter than `n` yield themselves as a single gram.
pub fn char_ngrams(text: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = normalize(text).chars().collect();
    if chars.is_empty() || n == 0 {
        return HashSet::new();
    }
    if chars.len() <= n {
        return HashSet::from([chars.iter().collect::<String>()]);
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

/// Jaccard overlap of character n-grams.
pub fn ngram_jaccard(a: &str, b: &str, n: usize) -> f64 {
    jaccard(&char_ngrams(a, n), &char_ngrams(b, n))
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 { 0.0 } else { intersection as f64 / union as f64 }
}

fn soundex_digit(c: char) -> Option<char> {
    match c {
        'b' | 'f' | 'p' | 'v' => Some('1'),
        'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
        'd' | 't' => Some('3'),
        'l' => Some('4'),
        'm' | 'n' => Some('5'),
        'r' => Some('6'),
        _ => None,
    }
}

/// American Soundex: first letter plus three digits, e.g. `"Robert" -> "R163"`.
///
/// Non-letters are ignored. `h` and `w` do not separate equal codes; vowels
/// do. Returns an empty string when the input has no ASCII letters.
pub fn soundex(text: &str) -> String {
    let mut letters =
        text.chars().filter(char::is_ascii_alphabetic).map(|c| c.to_ascii_lowercase());
    let Some(first) = letters.next() else {
        return String::new();
    };

    let mut code = String::with_capacity(4);
    code.push(first.to_ascii_uppercase());
    let mut last = soundex_digit(first);

    for c in letters {
        if code.len() == 4 {
            break;
        }
        if c == 'h' || c == 'w' {
            continue;
        }
        match soundex_digit(c) {
            Some(digit) => {
                if last != Some(digit) {
                    code.push(digit);
                }
                last = Some(digit);
            }
            None => last = None,
        }
    }

    while code.len() < 4 {
        code.push('0');
    }
    code
}

/// 1.0 when both strings share a non-empty Soundex code.
pub fn soundex_similarity(a: &str, b: &str) -> f64 {
    let code = soundex(a);
    if !code.is_empty() && code == soundex(b) { 1.0 } else { 0.0 }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude. Callers are expected to
/// check that the dimensions agree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Two field values could not be compared with the chosen function.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{comparator} cannot compare {left} with {right}")]
pub struct ComparisonError {
    /// Name of the comparator.
    pub comparator: &'static str,
    /// Description of the left value.
    pub left: String,
    /// Description of the right value.
    pub right: String,
}

/// The similarity function applied to one field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Comparator {
    /// Normalized string equality (identifiers, emails, phones).
    Exact,
    /// Normalized edit distance.
    Levenshtein,
    /// Jaro-Winkler.
    JaroWinkler,
    /// Word-token Jaccard.
    TokenJaccard,
    /// Character n-gram Jaccard.
    NgramJaccard {
        /// Gram size.
        n: usize,
    },
    /// Soundex-code equality.
    Soundex,
    /// Cosine similarity of vector fields.
    Cosine,
}

impl Comparator {
    /// Stable name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Comparator::Exact => "exact",
            Comparator::Levenshtein => "levenshtein",
            Comparator::JaroWinkler => "jaro_winkler",
            Comparator::TokenJaccard => "token_jaccard",
            Comparator::NgramJaccard { .. } => "ngram_jaccard",
            Comparator::Soundex => "soundex",
            Comparator::Cosine => "cosine",
        }
    }

    /// Compare two present values.
    ///
    /// # Errors
    ///
    /// Returns [`ComparisonError`] when the value types do not fit the
    /// comparator (a vector for a string function, mismatched dimensions, ...).
    pub fn compare(&self, a: &FieldValue, b: &FieldValue) -> Result<f64, ComparisonError> {
        let mismatch = |left: String, right: String| ComparisonError {
            comparator: self.name(),
            left,
            right,
        };

        if let Comparator::Cosine = self {
            return match (a.as_vector(), b.as_vector()) {
                (Some(x), Some(y)) if x.len() == y.len() => Ok(cosine_similarity(x, y) as f64),
                (Some(x), Some(y)) => {
                    Err(mismatch(format!("vector[{}]", x.len()), format!("vector[{}]", y.len())))
                }
                _ => Err(mismatch(a.kind().to_string(), b.kind().to_string())),
            };
        }

        match (a.as_text(), b.as_text()) {
            (Some(x), Some(y)) => self
                .text_similarity(&x, &y)
                .ok_or_else(|| mismatch(a.kind().to_string(), b.kind().to_string())),
            _ => Err(mismatch(a.kind().to_string(), b.kind().to_string())),
        }
    }

    fn text_similarity(&self, x: &str, y: &str) -> Option<f64> {
        let score = match self {
            Comparator::Exact => exact(x, y),
            Comparator::Levenshtein => levenshtein_similarity(x, y),
            Comparator::JaroWinkler => jaro_winkler_similarity(x, y),
            Comparator::TokenJaccard => token_jaccard(x, y),
            Comparator::NgramJaccard { n } => ngram_jaccard(x, y, *n),
            Comparator::Soundex => soundex_similarity(x, y),
            Comparator::Cosine => return None,
        };
        Some(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soundex_reference_codes() {
        assert_eq!(soundex("Robert"), "R163");
        assert_eq!(soundex("Rupert"), "R163");
        assert_eq!(soundex("Ashcraft"), "A261");
        assert_eq!(soundex("Tymczak"), "T522");
        assert_eq!(soundex("Pfister"), "P236");
        assert_eq!(soundex("Jon"), soundex("John"));
        assert_eq!(soundex("Smith"), soundex("Smyth"));
        assert_eq!(soundex("42"), "");
    }

    #[test]
    fn edit_distance_is_normalized() {
        assert!((levenshtein_similarity("Jon Smith", "jon smith") - 1.0).abs() < 1e-12);
        let s = levenshtein_similarity("Jon Smith", "John Smith");
        assert!(s > 0.85 && s < 1.0, "got {s}");
        assert_eq!(levenshtein_similarity("", ""), 1.0);
    }

    #[test]
    fn token_and_ngram_overlap() {
        assert_eq!(token_jaccard("Acme  Corp", "acme corp"), 1.0);
        assert!((token_jaccard("acme corp", "acme inc") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(ngram_jaccard("ab", "ab", 3), 1.0);
        assert!(ngram_jaccard("smith", "smyth", 2) > 0.0);
        assert_eq!(ngram_jaccard("abc", "xyz", 2), 0.0);
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn comparator_rejects_incomparable_values() {
        let text = FieldValue::from("abc");
        let vector = FieldValue::from(vec![1.0f32, 0.0]);
        assert!(Comparator::Levenshtein.compare(&text, &vector).is_err());
        assert!(Comparator::Cosine.compare(&text, &vector).is_err());
        let short = FieldValue::from(vec![1.0f32]);
        let err = Comparator::Cosine.compare(&vector, &short).unwrap_err();
        assert_eq!(err.left, "vector[2]");
        assert_eq!(Comparator::Exact.compare(&text, &FieldValue::from("ABC ")).unwrap(), 1.0);
    }

    #[test]
    fn numbers_compare_as_text() {
        let a = FieldValue::Number(5550100.0);
        let b = FieldValue::from("5550100");
        assert_eq!(Comparator::Exact.compare(&a, &b).unwrap(), 1.0);
    }

    #[test]
    fn large_whole_numbers_stay_distinct() {
        let a = FieldValue::Number(1e19);
        let b = FieldValue::Number(2e19);
        assert_eq!(Comparator::Exact.compare(&a, &b).unwrap(), 0.0);
        assert_eq!(Comparator::Exact.compare(&a, &a.clone()).unwrap(), 1.0);
        let negative = FieldValue::Number(-1e19);
        let more_negative = FieldValue::Number(-3e19);
        assert_eq!(Comparator::Exact.compare(&negative, &more_negative).unwrap(), 0.0);
    }
}
