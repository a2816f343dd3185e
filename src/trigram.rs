//! Trigram similarity (pg_trgm semantics)
//!
//! Each word (maximal alphanumeric run, lowercased) is padded with two
//! leading spaces and one trailing space and cut into three-character
//! windows. Similarity is the Jaccard ratio of the two trigram sets, in
//! `[0.0, 1.0]`.

use std::collections::HashSet;

/// Default match threshold
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Extract the trigram set of a string
pub fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();

    for word in s
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(std::iter::once(' '))
            .collect();

        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }

    set
}

/// Similarity of two strings
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);

    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;

    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigram_extraction() {
        let t = trigrams("cat");
        assert_eq!(t.len(), 4);
        assert!(t.contains(&[' ', ' ', 'c']));
        assert!(t.contains(&[' ', 'c', 'a']));
        assert!(t.contains(&['c', 'a', 't']));
        assert!(t.contains(&['a', 't', ' ']));
    }

    #[test]
    fn test_identical_strings() {
        assert_eq!(similarity("babel-fish", "babel-fish"), 1.0);
        // Hyphens and spaces are both word separators
        assert_eq!(similarity("babel fish", "babel-fish"), 1.0);
        assert_eq!(similarity("Babel Fish", "babel-fish"), 1.0);
    }

    #[test]
    fn test_partial_overlap() {
        let score = similarity("gargle-blaster", "pan-galactic-gargle-blaster");
        assert!(score > DEFAULT_THRESHOLD, "score was {}", score);
        assert!(score < 1.0);

        let unrelated = similarity("gargle-blaster", "towel");
        assert!(unrelated < DEFAULT_THRESHOLD, "score was {}", unrelated);
    }

    #[test]
    fn test_symmetric() {
        let a = similarity("improbability drive", "infinite improbability");
        let b = similarity("infinite improbability", "improbability drive");
        assert!((a - b).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(similarity("", "towel"), 0.0);
        assert_eq!(similarity("---", "---"), 0.0);
    }
}
