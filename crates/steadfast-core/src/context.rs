//! Execution context propagation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies where in a composite execution an operation is running.
///
/// A context is assembled once per dispatch (workflow → phase/branch →
/// operation) and then cloned into every hook invocation and log line.
/// It is never mutated mid-execution; narrowing happens by cloning with
/// the extra field set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub phase_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_id: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a standalone operation outside any workflow.
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    pub fn in_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn in_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    pub fn in_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (label, value) in [
            ("workflow", &self.workflow_id),
            ("branch", &self.branch_id),
            ("phase", &self.phase_id),
            ("node", &self.node_id),
            ("request", &self.request_id),
        ] {
            if let Some(value) = value {
                if wrote {
                    f.write_str(" ")?;
                }
                write!(f, "{label}={value}")?;
                wrote = true;
            }
        }
        if !wrote {
            f.write_str("<root>")?;
        }
        Ok(())
    }
}
