//! Workflow registry
//!
//! Workers resolve the procedure for an execution by name from their
//! compiled registrations; the catalog's source bundle is the versioned
//! record of what those registrations were built from.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::errors::ExecutionError;
use crate::workflow::Workflow;

/// Name → workflow lookup table.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workflow: Workflow) {
        let name = workflow.name().to_string();
        info!(workflow = %name, "registered workflow");
        self.workflows.write().insert(name, Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workflow>, ExecutionError> {
        self.workflows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::WorkflowNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register(Workflow::new("greeter", |_ctx| async {
            Ok(json!("hello"))
        }));

        assert!(registry.contains("greeter"));
        assert!(registry.get("greeter").is_ok());
        assert_eq!(registry.names(), vec!["greeter"]);
    }

    #[test]
    fn test_missing_workflow() {
        let registry = WorkflowRegistry::new();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::WorkflowNotFound { name } if name == "nope"
        ));
    }

    #[test]
    fn test_latest_registration_wins() {
        let registry = WorkflowRegistry::new();
        registry.register(Workflow::new("wf", |_ctx| async { Ok(json!(1)) }));
        registry.register(Workflow::new("wf", |_ctx| async { Ok(json!(2)) }));
        assert_eq!(registry.names().len(), 1);
    }
}
