//! Keyword extraction and query building for full-text search.
//!
//! Both the FTS5 query and the `LIKE` fallback are built from the same keyword
//! set, so a degraded search matches on exactly the terms the ranked one would.

use rusqlite::types::Value;

/// Keywords shorter than this are dropped.
const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "also", "been", "before", "being", "below",
    "between", "both", "could", "does", "doing", "down", "during", "each", "from", "further",
    "have", "having", "here", "into", "just", "more", "most", "once", "only", "other", "over",
    "same", "should", "some", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "under", "until", "very", "want", "were", "what", "when",
    "where", "which", "while", "will", "with", "would", "your", "yours",
];

/// Lowercase, split on non-alphanumeric, drop stop words and short tokens. Order-preserving, unique.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_KEYWORD_LEN)
    {
        if STOP_WORDS.contains(&token) || keywords.iter().any(|k| k == token) {
            continue;
        }
        keywords.push(token.to_string());
    }
    keywords
}

/// OR-combined FTS5 MATCH expression. Each keyword is quoted so FTS5 never
/// parses it as an operator.
pub fn fts_match_expression(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// `LIKE` fallback clause: for every keyword, any of `columns` contains it; keywords OR-combined.
///
/// Placeholders are numbered from `first_param`; returns the clause and its bound values.
pub fn like_clause(keywords: &[String], columns: &[&str], first_param: usize) -> (String, Vec<Value>) {
    let mut params = Vec::with_capacity(keywords.len());
    let per_keyword: Vec<String> = keywords
        .iter()
        .enumerate()
        .map(|(i, keyword)| {
            let n = first_param + i;
            params.push(Value::Text(format!("%{keyword}%")));
            let alternatives: Vec<String> =
                columns.iter().map(|col| format!("{col} LIKE ?{n}")).collect();
            format!("({})", alternatives.join(" OR "))
        })
        .collect();
    (format!("({})", per_keyword.join(" OR ")), params)
}
