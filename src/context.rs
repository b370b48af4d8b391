//! Splits a focus rule's result budget between memories and chat history.

/// Budget used when an assistant has no focus rule.
pub const DEFAULT_MAX_RESULTS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetedContext<M, H> {
    pub memories: Vec<M>,
    pub history: Vec<H>,
}

/// Slot counts `(memories, history)` for a budget of `max_results`.
///
/// Memories get `floor(n / 2)`, history gets `ceil(n / 2)`. Negative budgets clamp to 0.
pub fn split_budget(max_results: Option<i64>) -> (usize, usize) {
    let n = max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(0) as usize;
    let memory_slots = n / 2;
    (memory_slots, n - memory_slots)
}

/// Keep the leading memories (most relevant first) and the trailing history
/// (most recent last). Inputs are left untouched.
pub fn budget_context<M: Clone, H: Clone>(
    max_results: Option<i64>,
    memories: &[M],
    history: &[H],
) -> BudgetedContext<M, H> {
    let (memory_slots, history_slots) = split_budget(max_results);
    let memories = memories.iter().take(memory_slots).cloned().collect();
    let skip = history.len().saturating_sub(history_slots);
    let history = history[skip..].to_vec();
    BudgetedContext { memories, history }
}
