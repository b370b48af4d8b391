use serde::Serialize;

use crate::database::AssistantDatabase;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub assistant_id: String,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// `completed / total`, 0 when there are no tasks.
    pub success_rate: f64,
    pub feedback_count: u64,
    pub feedback_average: f64,
}

/// Read-only aggregation of task outcomes and feedback for one assistant.
pub fn evaluate_performance(
    db: &AssistantDatabase,
    assistant_id: &str,
) -> Result<PerformanceReport, EngineError> {
    if db.get_assistant(assistant_id)?.is_none() {
        return Err(EngineError::not_found(format!("assistant {}", assistant_id)));
    }

    let counts = db.task_counts(assistant_id)?;
    let feedback = db.feedback_stats(assistant_id)?;
    let success_rate = if counts.total == 0 {
        0.0
    } else {
        counts.completed as f64 / counts.total as f64
    };

    Ok(PerformanceReport {
        assistant_id: assistant_id.to_string(),
        total_tasks: counts.total,
        completed_tasks: counts.completed,
        failed_tasks: counts.failed,
        success_rate,
        feedback_count: feedback.count,
        feedback_average: feedback.average,
    })
}
