//! Jaccard clustering and near-duplicate detection over observation term sets.

use std::collections::HashSet;

use crate::store::{NewObservation, Observation};

const MIN_TERM_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "was", "were", "are", "has", "have",
    "had", "not", "but", "into", "when", "then", "than", "also", "which", "will", "would", "can",
    "could", "should", "been", "being", "its", "our", "their", "there", "these", "those", "use",
    "used", "using", "via", "all", "any", "now", "only", "out", "per",
];

/// Anything whose text can be reduced to a term set.
pub trait TermSource {
    fn title(&self) -> Option<&str>;
    fn narrative(&self) -> Option<&str>;
    fn facts(&self) -> &[String];
    /// Files read followed by files modified.
    fn files(&self) -> Vec<&str>;
}

impl TermSource for Observation {
    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    fn narrative(&self) -> Option<&str> {
        self.narrative.as_deref()
    }
    fn facts(&self) -> &[String] {
        &self.facts
    }
    fn files(&self) -> Vec<&str> {
        self.files_read
            .iter()
            .chain(&self.files_modified)
            .map(String::as_str)
            .collect()
    }
}

impl TermSource for NewObservation {
    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    fn narrative(&self) -> Option<&str> {
        self.narrative.as_deref()
    }
    fn facts(&self) -> &[String] {
        &self.facts
    }
    fn files(&self) -> Vec<&str> {
        self.files_read
            .iter()
            .chain(&self.files_modified)
            .map(String::as_str)
            .collect()
    }
}

/// Terms from title, narrative and facts, plus the lowercased base name of every file.
pub fn extract_terms<T: TermSource + ?Sized>(record: &T) -> HashSet<String> {
    let mut terms = HashSet::new();
    let texts = record
        .title()
        .into_iter()
        .chain(record.narrative())
        .chain(record.facts().iter().map(String::as_str));
    for text in texts {
        add_tokens(&mut terms, text);
    }
    for path in record.files() {
        let base = path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path);
        if !base.is_empty() {
            terms.insert(base.to_lowercase());
        }
    }
    terms
}

fn add_tokens(terms: &mut HashSet<String>, text: &str) {
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN && !STOP_WORDS.contains(t))
    {
        terms.insert(token.to_string());
    }
}

/// `|A ∩ B| / |A ∪ B|`. Two empty sets are identical (1.0); one empty set shares nothing (0.0).
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Indices of cluster representatives, in input order.
///
/// Greedy single pass: each unclustered record becomes a representative and
/// absorbs every later record within `threshold` of it. Absorbed records never
/// absorb others.
pub fn cluster_indices<T: TermSource>(records: &[T], threshold: f64) -> Vec<usize> {
    if records.len() <= 1 {
        return (0..records.len()).collect();
    }
    let terms: Vec<HashSet<String>> = records.iter().map(extract_terms).collect();
    let mut clustered = vec![false; records.len()];
    let mut representatives = Vec::new();

    for i in 0..records.len() {
        if clustered[i] {
            continue;
        }
        clustered[i] = true;
        representatives.push(i);
        for j in (i + 1)..records.len() {
            if !clustered[j] && jaccard(&terms[i], &terms[j]) >= threshold {
                clustered[j] = true;
            }
        }
    }
    representatives
}

/// Cluster representatives. Callers pre-sort by preference (e.g. recency).
pub fn cluster<T: TermSource + Clone>(records: &[T], threshold: f64) -> Vec<T> {
    cluster_indices(records, threshold)
        .into_iter()
        .map(|i| records[i].clone())
        .collect()
}

/// True if `candidate` is within `threshold` of any record in `existing`.
pub fn is_similar_to_any<C, E>(candidate: &C, existing: &[E], threshold: f64) -> bool
where
    C: TermSource + ?Sized,
    E: TermSource,
{
    let candidate_terms = extract_terms(candidate);
    existing
        .iter()
        .any(|e| jaccard(&candidate_terms, &extract_terms(e)) >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObservationType;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn obs(title: &str, narrative: &str) -> NewObservation {
        NewObservation {
            title: Some(title.into()),
            narrative: Some(narrative.into()),
            ..NewObservation::new(ObservationType::Discovery)
        }
    }

    #[test]
    fn jaccard_edge_cases() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
        assert_eq!(jaccard(&set(&["a"]), &set(&[])), 0.0);
        assert_eq!(jaccard(&set(&[]), &set(&["a"])), 0.0);
        assert_eq!(jaccard(&set(&["a", "b", "c"]), &set(&["b", "c", "d"])), 0.5);
    }

    #[test]
    fn extract_terms_filters_and_adds_file_basenames() {
        let mut o = obs("Fix the JWT refresh", "Tokens were expiring early");
        o.facts = vec!["refresh window is 5m".into()];
        o.files_modified = vec!["src/auth/Token.rs".into()];
        o.files_read = vec!["C:\\repo\\config.toml".into()];

        let terms = extract_terms(&o);
        for expected in ["fix", "jwt", "refresh", "tokens", "expiring", "early", "window", "token.rs", "config.toml"] {
            assert!(terms.contains(expected), "missing {expected}");
        }
        assert!(!terms.contains("the"));
        assert!(!terms.contains("were"));
        assert!(!terms.contains("5m"));
    }

    #[test]
    fn clusters_similar_authentication_records() {
        let records = vec![
            obs("authentication token refresh", "session authentication token refresh logic"),
            obs("authentication token refresh", "authentication token refresh logic updated"),
            obs("database migration", "schema migration adds index"),
        ];
        let reps = cluster(&records, 0.4);
        assert!(reps.len() <= 2);
        assert_eq!(reps[0].narrative, records[0].narrative);
        assert!(reps.iter().any(|r| r.title.as_deref() == Some("database migration")));
    }

    #[test]
    fn distinct_records_unclustered_at_low_threshold() {
        let records: Vec<NewObservation> = [
            ("kafka consumer lag", "partition rebalance"),
            ("redis eviction policy", "allkeys lru"),
            ("postgres vacuum", "autovacuum tuning"),
            ("nginx upstream", "keepalive timeout"),
            ("docker layers", "multistage build"),
            ("kubernetes ingress", "path routing"),
            ("terraform state", "remote backend locking"),
            ("grafana dashboards", "panel variables"),
            ("prometheus scraping", "relabel configs"),
            ("elasticsearch shards", "replica allocation"),
        ]
        .iter()
        .map(|(t, n)| obs(t, n))
        .collect();
        assert_eq!(cluster(&records, 0.4).len(), 10);
    }

    #[test]
    fn greedy_is_not_transitive() {
        // a~b and b~c but a and c are below threshold: b is absorbed by a, c survives
        let a = obs("alpha beta gamma delta", "");
        let b = obs("beta gamma delta epsilon", "");
        let c = obs("gamma delta epsilon zeta", "");
        let reps = cluster_indices(&[a, b, c], 0.6);
        assert_eq!(reps, vec![0, 2]);
    }

    #[test]
    fn trivial_inputs_unchanged() {
        let empty: Vec<NewObservation> = Vec::new();
        assert!(cluster(&empty, 0.4).is_empty());
        let one = vec![obs("x", "")];
        assert_eq!(cluster(&one, 0.4).len(), 1);
    }

    #[test]
    fn similar_to_any() {
        let existing = vec![obs("retry backoff policy", "exponential backoff with jitter")];
        assert!(is_similar_to_any(
            &obs("retry backoff policy", "exponential backoff with jitter"),
            &existing,
            0.8
        ));
        assert!(!is_similar_to_any(&obs("logging format", "json lines"), &existing, 0.8));
        let none: Vec<NewObservation> = Vec::new();
        assert!(!is_similar_to_any(&obs("a", "b"), &none, 0.8));
    }
}
