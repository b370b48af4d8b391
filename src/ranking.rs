//! Heuristic assistant ranking from owned memories, tags and feedback.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::database::AssistantDatabase;
use crate::error::EngineError;

pub const SUGGESTION_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSuggestion {
    pub assistant_id: String,
    pub name: String,
    pub score: f64,
    pub matched_memories: usize,
    pub tag_overlap: usize,
    pub feedback_average: f64,
}

/// Score every assistant and return the best few.
///
/// `score = owned matched memories + tag overlap + mean feedback`. Ties go to
/// the assistant with more matched memories, then to the smaller id.
pub fn suggest_assistants(
    db: &AssistantDatabase,
    description: &str,
    tags: &[String],
) -> Result<Vec<AssistantSuggestion>, EngineError> {
    let description = description.trim();
    if description.is_empty() {
        return Err(EngineError::validation("description is required"));
    }
    let wanted: HashSet<String> = tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let wanted_list: Vec<String> = wanted.iter().cloned().collect();

    let matched: HashSet<String> = db
        .search_memories(description, &wanted_list)?
        .into_iter()
        .map(|m| m.id)
        .collect();

    let mut suggestions = Vec::new();
    for assistant in db.list_assistants()? {
        let matched_memories = db
            .owned_memory_ids(&assistant.id)?
            .intersection(&matched)
            .count();
        let tag_overlap = db
            .assistant_tag_names(&assistant.id)?
            .iter()
            .filter(|name| wanted.contains(*name))
            .count();
        let feedback_average = db.feedback_stats(&assistant.id)?.average;

        suggestions.push(AssistantSuggestion {
            score: matched_memories as f64 + tag_overlap as f64 + feedback_average,
            assistant_id: assistant.id,
            name: assistant.name,
            matched_memories,
            tag_overlap,
            feedback_average,
        });
    }

    suggestions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.matched_memories.cmp(&a.matched_memories))
            .then_with(|| a.assistant_id.cmp(&b.assistant_id))
    });
    suggestions.truncate(SUGGESTION_LIMIT);

    tracing::debug!(
        "Ranked assistants for '{}': {} matched memories, top {:?}",
        description,
        matched.len(),
        suggestions.first().map(|s| s.assistant_id.as_str())
    );
    Ok(suggestions)
}
