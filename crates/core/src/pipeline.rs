//! Dependency planning for pipelined session calls.
//!
//! A pipeline is a list of render calls where a call may name earlier calls it
//! depends on (`after`). Planning groups the calls into waves: every call in a
//! wave depends only on calls from earlier waves, so each wave can run
//! concurrently once the previous one has finished.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::CoreError;
use crate::job::{RenderJob, RenderSource};

/// Longest call id accepted.
pub const MAX_CALL_ID_LEN: usize = 64;

/// One call inside a pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineCall {
    pub id: String,
    #[serde(default)]
    pub after: Vec<String>,
    pub job: RenderJob,
}

/// Placeholder a dependent call uses to reference a dependency's output.
pub fn output_placeholder(call_id: &str) -> String {
    format!("{{{{{call_id}.output_url}}}}")
}

/// Group call indices into dependency waves.
///
/// Fails on empty or duplicate ids, references to unknown ids, self
/// references and cycles. Indices inside a wave keep input order.
pub fn plan_waves(calls: &[PipelineCall]) -> Result<Vec<Vec<usize>>, CoreError> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        validate_call_id(&call.id)?;
        if index_of.insert(call.id.as_str(), index).is_some() {
            return Err(CoreError::Validation(format!(
                "duplicate call id '{}'",
                call.id
            )));
        }
    }

    let mut remaining_deps = vec![0usize; calls.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); calls.len()];
    for (index, call) in calls.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &call.after {
            if dep == &call.id {
                return Err(CoreError::Validation(format!(
                    "call '{}' depends on itself",
                    call.id
                )));
            }
            let dep_index = *index_of.get(dep.as_str()).ok_or_else(|| {
                CoreError::Validation(format!(
                    "call '{}' depends on unknown call '{dep}'",
                    call.id
                ))
            })?;
            if seen.insert(dep_index) {
                remaining_deps[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut waves = Vec::new();
    let mut current: Vec<usize> = (0..calls.len())
        .filter(|i| remaining_deps[*i] == 0)
        .collect();
    let mut planned = 0;

    while !current.is_empty() {
        planned += current.len();
        let mut next = Vec::new();
        for &index in &current {
            for &dependent in &dependents[index] {
                remaining_deps[dependent] -= 1;
                if remaining_deps[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        waves.push(current);
        current = next;
    }

    if planned != calls.len() {
        let stuck: Vec<&str> = (0..calls.len())
            .filter(|i| remaining_deps[*i] > 0)
            .map(|i| calls[i].id.as_str())
            .collect();
        return Err(CoreError::Validation(format!(
            "dependency cycle between calls: {}",
            stuck.join(", ")
        )));
    }

    Ok(waves)
}

/// Replace `{{<id>.output_url}}` placeholders in the job's HTML or URL with
/// the output URLs of finished dependencies.
pub fn substitute_outputs(job: &mut RenderJob, outputs: &HashMap<String, String>) {
    let text = match &mut job.source {
        RenderSource::Html(html) => html,
        RenderSource::Url(url) => url,
    };
    if !text.contains("{{") {
        return;
    }
    for (call_id, url) in outputs {
        let placeholder = output_placeholder(call_id);
        if text.contains(&placeholder) {
            *text = text.replace(&placeholder, url);
        }
    }
}

fn validate_call_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() || id.len() > MAX_CALL_ID_LEN {
        return Err(CoreError::Validation(format!(
            "call ids must be 1 to {MAX_CALL_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "call id '{id}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}
