//! Matching primitives shared across protocol parsers.
//!
//! Three families, in roughly decreasing strictness:
//!
//! - structural scoring over decoded JSON maps (`map_score`)
//! - string edit distance (`levenshtein`)
//! - binary k-shingle Jaccard similarity (`jaccard_similarity`)
//!
//! Fuzzy comparisons refuse payloads over [`FUZZY_MAX_PAYLOAD`]; callers
//! treat the refusal as "no match".

use std::collections::HashSet;

use serde_json::Value;

/// Payloads larger than this are never fuzzy-matched.
pub const FUZZY_MAX_PAYLOAD: usize = 512 * 1024;

/// Shingle size bounds; `adaptive_k` picks within them.
const MIN_K: usize = 3;
const MAX_K: usize = 8;
const DEFAULT_K: usize = 5;

/// Pick a shingle length for a payload of `len` bytes.
///
/// Short payloads need short shingles to produce any overlap at all;
/// long payloads benefit from longer shingles that suppress accidental
/// matches.
pub fn adaptive_k(len: usize) -> usize {
    if len < 64 {
        MIN_K
    } else if len <= 1024 {
        DEFAULT_K
    } else {
        MAX_K
    }
}

fn shingle_set(data: &[u8], k: usize) -> HashSet<&[u8]> {
    if data.len() < k {
        // Degenerate payload: treat the whole thing as one shingle.
        return HashSet::from([data]);
    }
    data.windows(k).collect()
}

/// Jaccard similarity of the k-shingle sets of two payloads, with `k`
/// chosen adaptively from the first payload's length.
///
/// Returns `None` when either payload exceeds [`FUZZY_MAX_PAYLOAD`].
pub fn jaccard_similarity(a: &[u8], b: &[u8]) -> Option<f64> {
    if a.len() > FUZZY_MAX_PAYLOAD || b.len() > FUZZY_MAX_PAYLOAD {
        return None;
    }
    Some(jaccard_with_k(a, b, adaptive_k(a.len())))
}

/// Jaccard similarity with an explicit shingle length.
pub fn jaccard_with_k(a: &[u8], b: &[u8], k: usize) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let sa = shingle_set(a, k);
    let sb = shingle_set(b, k);
    let intersection = sa.intersection(&sb).count();
    let union = sa.len() + sb.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Levenshtein edit distance between two strings, by bytes.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Whether every byte is printable ASCII (0x20..=0x7E).
pub fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (0x20..=0x7E).contains(&b))
}

/// Recursive structural score: the fraction of `expected`'s leaves that
/// are present and equal in `actual`.
///
/// Maps and arrays recurse; scalars count one leaf each. A type
/// mismatch scores zero for that subtree.
pub fn map_score(expected: &Value, actual: &Value) -> f64 {
    let (matched, total) = score_counts(expected, actual);
    if total == 0 {
        return 1.0;
    }
    matched as f64 / total as f64
}

fn score_counts(expected: &Value, actual: &Value) -> (usize, usize) {
    match expected {
        Value::Object(emap) => {
            let mut matched = 0;
            let mut total = 0;
            for (key, evalue) in emap {
                let (m, t) = match actual.get(key) {
                    Some(avalue) => score_counts(evalue, avalue),
                    None => (0, leaf_count(evalue)),
                };
                matched += m;
                total += t;
            }
            (matched, total)
        }
        Value::Array(earr) => match actual {
            Value::Array(aarr) => {
                let mut matched = 0;
                let mut total = 0;
                for (i, evalue) in earr.iter().enumerate() {
                    let (m, t) = match aarr.get(i) {
                        Some(avalue) => score_counts(evalue, avalue),
                        None => (0, leaf_count(evalue)),
                    };
                    matched += m;
                    total += t;
                }
                (matched, total)
            }
            _ => (0, leaf_count(expected)),
        },
        scalar => {
            if scalar == actual {
                (1, 1)
            } else {
                (0, 1)
            }
        }
    }
}

fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.values().map(leaf_count).sum(),
        Value::Array(arr) => arr.iter().map(leaf_count).sum(),
        _ => 1,
    }
}
