//! Word-set similarity for dropping near-duplicate model output.

use std::collections::HashSet;

/// Items whose similarity exceeds this are the same item.
pub const DUPLICATE_THRESHOLD: f64 = 0.8;

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Jaccard similarity of the case-folded word sets of `a` and `b`.
pub fn word_similarity(a: &str, b: &str) -> f64 {
    jaccard(&word_set(a), &word_set(b))
}

/// Keep the first of every run of near-duplicates, comparing `text(item)`.
pub fn dedup_similar<T, F>(items: Vec<T>, text: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut kept = Vec::with_capacity(items.len());
    let mut kept_words: Vec<HashSet<String>> = Vec::new();
    for item in items {
        let words = word_set(text(&item));
        if kept_words
            .iter()
            .any(|k| jaccard(&words, k) > DUPLICATE_THRESHOLD)
        {
            continue;
        }
        kept_words.push(words);
        kept.push(item);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_similarity() {
        assert_eq!(word_similarity("Encrypt Data", "encrypt data"), 1.0);
        assert_eq!(word_similarity("", ""), 0.0);
        assert!((word_similarity("a b c d", "a b c e") - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_keeps_first_of_near_duplicates() {
        let items = vec![
            "The system shall encrypt all patient data at rest",
            "The system shall encrypt all patient data at rest.",
            "the system shall ENCRYPT all patient data at rest",
            "Sessions time out after fifteen minutes",
        ];
        let kept = dedup_similar(items, |s| *s);
        assert_eq!(
            kept,
            vec![
                "The system shall encrypt all patient data at rest",
                "The system shall encrypt all patient data at rest.",
                "Sessions time out after fifteen minutes",
            ]
        );
    }

    #[test]
    fn test_threshold_is_exclusive() {
        // 4 shared of 5 distinct words: exactly 0.8, kept
        let kept = dedup_similar(vec!["a b c d", "a b c d e"], |s| *s);
        assert_eq!(kept.len(), 2);
    }
}
