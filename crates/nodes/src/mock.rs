//! Test doubles for [`StepExecutor`] and [`BenchmarkProbe`].
//!
//! Useful in unit and integration tests where a real step runtime or
//! benchmark harness is either unavailable or irrelevant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fabric::NodeId;
use serde_json::{json, Value};

use crate::manifest::Capability;
use crate::traits::{BenchmarkProbe, ExecutionContext, StepExecutor};
use crate::NodeError;

/// Behaviour injected into `MockExecutor` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error this many times, then return the value.
    FlakyThenReturn(u32, Value),
}

/// A mock executor that records every call it receives and returns a
/// programmer-specified result.
pub struct MockExecutor {
    /// Label used in test assertions.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// (node, payload) for every call, in call order.
    pub calls: Arc<Mutex<Vec<(NodeId, Value)>>>,
    failures: AtomicU32,
}

impl MockExecutor {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: AtomicU32::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FlakyThenReturn(failures, value))
    }

    /// Number of times this executor has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn output(&self, value: &Value) -> Value {
        // Tag the output with the executor name so tests can trace data flow.
        let mut out = json!({ "step": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl StepExecutor for MockExecutor {
    async fn execute(&self, payload: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        self.calls.lock().unwrap().push((ctx.node_id.clone(), payload));

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenReturn(n, v) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < *n {
                    Err(NodeError::Retryable(format!("{} flaked", self.name)))
                } else {
                    Ok(self.output(v))
                }
            }
        }
    }
}

/// Probe returning fixed measurements per (node, capability).
///
/// Pairs without a configured measurement fail with a retryable error, the
/// same way an unreachable node would.
#[derive(Default)]
pub struct MockProbe {
    measurements: HashMap<(NodeId, String), f64>,
}

impl MockProbe {
    pub fn with(mut self, node: &str, capability: &str, measured: f64) -> Self {
        self.measurements
            .insert((NodeId::from(node), capability.to_owned()), measured);
        self
    }

    /// Every capability measures exactly as declared.
    pub fn honest() -> HonestProbe {
        HonestProbe
    }
}

#[async_trait]
impl BenchmarkProbe for MockProbe {
    async fn measure(&self, node_id: &NodeId, capability: &Capability) -> Result<f64, NodeError> {
        self.measurements
            .get(&(node_id.clone(), capability.name.clone()))
            .copied()
            .ok_or_else(|| NodeError::Retryable(format!("no benchmark for {node_id}/{}", capability.name)))
    }
}

pub struct HonestProbe;

#[async_trait]
impl BenchmarkProbe for HonestProbe {
    async fn measure(&self, _node_id: &NodeId, capability: &Capability) -> Result<f64, NodeError> {
        Ok(capability.declared_performance)
    }
}
