use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pattern matching every workflow-scoped channel.
pub const WORKFLOW_PATTERN: &str = "workflow:*";

/// Pattern matching every task-scoped channel.
pub const TASK_PATTERN: &str = "task:*";

/// Channel carrying events for one workflow.
pub fn workflow_channel(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

/// Channel carrying events for one task.
pub fn task_channel(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// A workflow lifecycle event as published on `workflow:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: String,
    pub event: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A task lifecycle event as published on `task:<id>`.
///
/// When `workflow_id` is set the same event is mirrored onto the owning
/// workflow's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub event: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        assert_eq!(workflow_channel("wf-1"), "workflow:wf-1");
        assert_eq!(task_channel("t-9"), "task:t-9");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = TaskEvent {
            task_id: "t-1".into(),
            workflow_id: None,
            event: "started".into(),
            status: "running".into(),
            data: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("workflow_id").is_none());
        assert!(json.get("data").is_none());
        assert_eq!(json["task_id"], "t-1");
    }

    #[test]
    fn workflow_event_roundtrips_data() {
        let event = WorkflowEvent {
            workflow_id: "wf-1".into(),
            event: "completed".into(),
            status: "success".into(),
            data: Some(serde_json::json!({"output": 42})),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: WorkflowEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }
}
