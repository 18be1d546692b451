//! Stack-engine contract and the in-memory engine.
//!
//! The stack engine consumes a key-value parameter map and materializes
//! VMs, networks, and load balancers behind an opaque stack id. The
//! in-memory implementation is used by tests and dev mode: stacks
//! converge after a scripted number of polls and produce output values
//! shaped like a real deployment's.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use corral_common::{Error, Result};

use crate::driver::{StackOutputs, StackPoll, StackStatus};

/// Parameter map handed to the engine.
pub type StackParameters = BTreeMap<String, serde_json::Value>;

/// Operations the stack driver invokes on its engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackEngine: Send + Sync {
    /// Create a stack; returns its id.
    async fn create_stack(
        &self,
        name: &str,
        parameters: &StackParameters,
        timeout: Duration,
    ) -> Result<String>;

    /// Update a stack in place. `rollback` asks the engine to restore
    /// the previous shape if the update fails.
    async fn update_stack(
        &self,
        stack_id: &str,
        parameters: &StackParameters,
        rollback: bool,
    ) -> Result<()>;

    /// Delete a stack. Unknown ids surface as NotFound.
    async fn delete_stack(&self, stack_id: &str) -> Result<()>;

    /// Current status, reason, and outputs.
    async fn get_stack(&self, stack_id: &str) -> Result<StackPoll>;
}

struct StackRecord {
    name: String,
    parameters: StackParameters,
    status: StackStatus,
    reason: Option<String>,
    /// Polls left until the in-progress status resolves
    ticks_remaining: u32,
}

/// In-memory stack engine with scripted convergence.
pub struct InMemoryStackEngine {
    stacks: Mutex<HashMap<String, StackRecord>>,
    /// Polls an operation stays in progress before completing
    ticks_to_converge: u32,
    /// Reason injected into the next submitted operation, failing it
    pub fail_next_operation: Mutex<Option<String>>,
    /// When set, delete_stack reports a conflicting update in flight
    pub conflict_on_delete: Mutex<bool>,
}

impl InMemoryStackEngine {
    pub fn new(ticks_to_converge: u32) -> Self {
        Self {
            stacks: Mutex::new(HashMap::new()),
            ticks_to_converge,
            fail_next_operation: Mutex::new(None),
            conflict_on_delete: Mutex::new(false),
        }
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.lock().unwrap().len()
    }

    /// Engine-side name of a stack (tests assert on the naming scheme).
    pub fn stack_name(&self, stack_id: &str) -> Option<String> {
        self.stacks
            .lock()
            .unwrap()
            .get(stack_id)
            .map(|record| record.name.clone())
    }

    fn outputs_for(parameters: &StackParameters) -> StackOutputs {
        let node_count = parameters
            .get("node_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let master_count = parameters
            .get("master_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let coe_version = parameters
            .get("coe_version")
            .and_then(|v| v.as_str())
            .unwrap_or("v1.30.2");

        StackOutputs {
            api_address: Some("https://172.24.4.10:6443".to_string()),
            master_addresses: (0..master_count)
                .map(|i| format!("10.0.0.{}", 10 + i))
                .collect(),
            node_addresses: (0..node_count)
                .map(|i| format!("10.0.0.{}", 100 + i))
                .collect(),
            discovery_url: Some("https://discovery.etcd.example/abc123".to_string()),
            coe_version: Some(coe_version.to_string()),
            container_version: Some("1.7.20".to_string()),
        }
    }
}

#[async_trait]
impl StackEngine for InMemoryStackEngine {
    async fn create_stack(
        &self,
        name: &str,
        parameters: &StackParameters,
        _timeout: Duration,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let failure = self.fail_next_operation.lock().unwrap().take();
        let (status, reason, ticks) = match failure {
            Some(why) => (StackStatus::CreateFailed, Some(why), 0),
            None => (StackStatus::CreateInProgress, None, self.ticks_to_converge),
        };
        self.stacks.lock().unwrap().insert(
            id.clone(),
            StackRecord {
                name: name.to_string(),
                parameters: parameters.clone(),
                status,
                reason,
                ticks_remaining: ticks,
            },
        );
        Ok(id)
    }

    async fn update_stack(
        &self,
        stack_id: &str,
        parameters: &StackParameters,
        rollback: bool,
    ) -> Result<()> {
        let mut stacks = self.stacks.lock().unwrap();
        let record = stacks
            .get_mut(stack_id)
            .ok_or_else(|| Error::not_found("Stack", stack_id))?;

        let failure = self.fail_next_operation.lock().unwrap().take();
        match failure {
            Some(why) if rollback => {
                record.status = StackStatus::RollbackInProgress;
                record.reason = Some(why);
                record.ticks_remaining = self.ticks_to_converge;
            }
            Some(why) => {
                record.status = StackStatus::UpdateFailed;
                record.reason = Some(why);
                record.ticks_remaining = 0;
            }
            None => {
                record.status = StackStatus::UpdateInProgress;
                record.reason = None;
                record.ticks_remaining = self.ticks_to_converge;
            }
        }
        record.parameters = parameters.clone();
        Ok(())
    }

    async fn delete_stack(&self, stack_id: &str) -> Result<()> {
        if *self.conflict_on_delete.lock().unwrap() {
            return Err(Error::operation_in_progress(
                stack_id,
                "stack has an update in progress",
            ));
        }
        let mut stacks = self.stacks.lock().unwrap();
        let record = stacks
            .get_mut(stack_id)
            .ok_or_else(|| Error::not_found("Stack", stack_id))?;
        record.status = StackStatus::DeleteInProgress;
        record.reason = None;
        record.ticks_remaining = self.ticks_to_converge;
        Ok(())
    }

    async fn get_stack(&self, stack_id: &str) -> Result<StackPoll> {
        let mut stacks = self.stacks.lock().unwrap();
        let Some(record) = stacks.get_mut(stack_id) else {
            return Ok(StackPoll::new(StackStatus::Missing));
        };

        if record.ticks_remaining > 0 {
            record.ticks_remaining -= 1;
            if record.ticks_remaining == 0 {
                record.status = match record.status {
                    StackStatus::CreateInProgress => StackStatus::CreateComplete,
                    StackStatus::UpdateInProgress => StackStatus::UpdateComplete,
                    StackStatus::RollbackInProgress => StackStatus::RollbackComplete,
                    StackStatus::DeleteInProgress => StackStatus::DeleteComplete,
                    other => other,
                };
            }
        }

        let poll = StackPoll {
            status: record.status,
            reason: record.reason.clone(),
            outputs: if record.status == StackStatus::DeleteComplete {
                StackOutputs::default()
            } else {
                Self::outputs_for(&record.parameters)
            },
        };

        // A fully deleted stack disappears from the engine; subsequent
        // polls answer Missing.
        if record.status == StackStatus::DeleteComplete {
            stacks.remove(stack_id);
        }

        Ok(poll)
    }
}
