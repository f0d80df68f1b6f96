// ABOUTME: Task identifier naming protocol shared with the orchestrator.
// ABOUTME: "{job_id}_job" admits a whole job, "{job_id}_unit_{n}" one work unit.

const JOB_SUFFIX: &str = "_job";
const UNIT_MARKER: &str = "_unit_";

/// Task id used to admit a whole job.
pub fn job_task_id(job_id: &str) -> String {
    format!("{}{}", job_id, JOB_SUFFIX)
}

/// Task id used to admit one work unit of a job.
pub fn unit_task_id(job_id: &str, index: usize) -> String {
    format!("{}{}{}", job_id, UNIT_MARKER, index)
}

/// Recover the job id from a task id that follows the naming protocol.
///
/// Returns `None` for ids that match neither form.
pub fn job_id_of(task_id: &str) -> Option<&str> {
    if let Some(job_id) = task_id.strip_suffix(JOB_SUFFIX) {
        return (!job_id.is_empty()).then_some(job_id);
    }

    let pos = task_id.rfind(UNIT_MARKER)?;
    let (job_id, rest) = task_id.split_at(pos);
    let index = &rest[UNIT_MARKER.len()..];
    if job_id.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(job_id)
}
