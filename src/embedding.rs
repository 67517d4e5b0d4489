//! Deterministic text embeddings for similarity search.
//!
//! Hashed signed bag-of-words vectors: no external model dependency, pure and
//! reproducible across processes. Unrelated short texts land in different
//! buckets with low inner product in expectation.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Fixed embedding dimension shared by incidents and runbook chunks.
pub const EMBEDDING_DIM: usize = 384;

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

const STOPWORDS: &[&str] = &["services", "service", "incident"];

// The character class is fixed; the pattern always compiles.
#[allow(clippy::unwrap_used)]
fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"[a-z0-9_]+").unwrap())
}

/// Tokenize lower-cased text, dropping domain stopwords.
pub fn tokens(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let lowered = text.to_lowercase();
    token_re()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Bucket index and sign for a token, derived from its md5 digest.
///
/// The index comes from the first 32 bits of the digest; the sign from the
/// parity of the ninth hex character, so index and sign are independent.
fn hash_token(token: &str, dim: usize) -> (usize, f32) {
    let digest = md5::compute(token.as_bytes());
    let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % dim;
    let nibble = (digest[4] >> 4) & 0x0f;
    let sign = if nibble % 2 == 0 { 1.0 } else { -1.0 };
    (idx, sign)
}

/// Convert text into a deterministic unit-length embedding.
///
/// The zero vector (no tokens survive) is returned as-is, un-normalized.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; EMBEDDING_DIM];
    for token in tokens(text) {
        let (idx, sign) = hash_token(&token, EMBEDDING_DIM);
        vec[idx] += sign;
    }

    let norm = vec.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec;
    }
    vec.iter().map(|v| (*v as f64 / norm) as f32).collect()
}

/// Token-set Jaccard overlap. Two empty sets overlap 0.0, not 1.0.
pub fn jaccard(tokens_a: &[String], tokens_b: &[String]) -> f64 {
    let set_a: HashSet<&str> = tokens_a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = tokens_b.iter().map(String::as_str).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Euclidean distance between two vectors. Trailing elements of the longer
/// vector are ignored; callers enforce matching dimensions at persist time.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f64 {
        v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt()
    }

    #[test]
    fn embedding_is_unit_length_or_zero() {
        let embedded = embed_text("database connection pool exhausted");
        assert!((norm(&embedded) - 1.0).abs() < 1e-6);

        let empty = embed_text("");
        assert_eq!(norm(&empty), 0.0);
        assert_eq!(empty.len(), EMBEDDING_DIM);
    }

    #[test]
    fn embedding_is_deterministic() {
        let a = embed_text("api latency spike in us-east-1");
        let b = embed_text("api latency spike in us-east-1");
        assert_eq!(a, b);
    }

    #[test]
    fn stopwords_do_not_contribute() {
        // "service services incident" tokenizes to nothing
        let embedded = embed_text("service services incident");
        assert_eq!(norm(&embedded), 0.0);
    }

    #[test]
    fn tokens_split_on_the_word_class() {
        let toks = tokens("DB-pool: usage_high 93%");
        assert_eq!(toks, vec!["db", "pool", "usage_high", "93"]);
    }

    #[test]
    fn unrelated_texts_have_low_inner_product() {
        let a = embed_text("payment gateway timeout checkout");
        let b = embed_text("kubernetes node disk pressure eviction");
        let dot: f64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (*x as f64) * (*y as f64))
            .sum();
        assert!(dot.abs() < 0.5, "dot product {} unexpectedly high", dot);
    }

    #[test]
    fn hash_token_stays_in_bounds() {
        for token in ["api", "db", "cache", "queue", "worker", "x"] {
            let (idx, sign) = hash_token(token, EMBEDDING_DIM);
            assert!(idx < EMBEDDING_DIM);
            assert!(sign == 1.0 || sign == -1.0);
        }
    }

    #[test]
    fn jaccard_overlap_cases() {
        let a: Vec<String> = ["pool", "usage", "high"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["pool", "scaling"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 0.25).abs() < 1e-9);

        assert_eq!(jaccard(&[], &[]), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn l2_distance_of_identical_vectors_is_zero() {
        let v = embed_text("cache eviction storm");
        assert_eq!(l2_distance(&v, &v), 0.0);
    }
}
