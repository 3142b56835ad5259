//! Granular document builders.
//!
//! Document IDs follow `{type}_{sourceID}_{field}[_{index}]` with type prefixes
//! `obs`, `summary` and `prompt`.

use super::{DocumentMetadata, VectorDocument};
use crate::store::{Observation, RecordKind, SessionSummary, UserPrompt};

fn id_prefix(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Observation => "obs",
        RecordKind::Summary => "summary",
        RecordKind::Prompt => "prompt",
    }
}

/// Build a document ID. `index` is set for repeated fields such as facts.
pub fn doc_id(kind: RecordKind, source_id: i64, field: &str, index: Option<usize>) -> String {
    let prefix = id_prefix(kind);
    match index {
        Some(i) => format!("{prefix}_{source_id}_{field}_{i}"),
        None => format!("{prefix}_{source_id}_{field}"),
    }
}

fn document(
    kind: RecordKind,
    source_id: i64,
    field: &str,
    index: Option<usize>,
    content: &str,
    project: &str,
    scope: Option<&str>,
) -> VectorDocument {
    VectorDocument {
        doc_id: doc_id(kind, source_id, field, index),
        content: content.to_string(),
        metadata: DocumentMetadata {
            source_id,
            doc_type: kind.doc_type().to_string(),
            field_type: field.to_string(),
            project: project.to_string(),
            scope: scope.map(str::to_string),
        },
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

/// One document for the narrative and one per fact. Falls back to the title
/// (then subtitle) when there is neither.
pub fn observation_documents(obs: &Observation) -> Vec<VectorDocument> {
    let kind = RecordKind::Observation;
    let scope = Some(obs.scope.as_str());
    let mut docs = Vec::new();

    if let Some(narrative) = non_blank(obs.narrative.as_deref()) {
        docs.push(document(kind, obs.id, "narrative", None, narrative, &obs.project, scope));
    }
    for (i, fact) in obs.facts.iter().enumerate() {
        if let Some(fact) = non_blank(Some(fact)) {
            docs.push(document(kind, obs.id, "fact", Some(i), fact, &obs.project, scope));
        }
    }

    if docs.is_empty() {
        if let Some(title) = non_blank(obs.title.as_deref()) {
            docs.push(document(kind, obs.id, "title", None, title, &obs.project, scope));
        } else if let Some(subtitle) = non_blank(obs.subtitle.as_deref()) {
            docs.push(document(kind, obs.id, "subtitle", None, subtitle, &obs.project, scope));
        }
    }
    docs
}

/// One document per non-empty summary field.
pub fn summary_documents(summary: &SessionSummary) -> Vec<VectorDocument> {
    summary
        .fields()
        .into_iter()
        .map(|(field, text)| {
            document(
                RecordKind::Summary,
                summary.id,
                field,
                None,
                text,
                &summary.project,
                None,
            )
        })
        .collect()
}

pub fn prompt_documents(prompt: &UserPrompt) -> Vec<VectorDocument> {
    match non_blank(Some(&prompt.prompt_text)) {
        Some(text) => vec![document(
            RecordKind::Prompt,
            prompt.id,
            "prompt",
            None,
            text,
            &prompt.project,
            None,
        )],
        None => Vec::new(),
    }
}
