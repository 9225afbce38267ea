//! Flow graph validation. Run this before executing a flow.
//!
//! Rules enforced:
//! 1. Step IDs must be unique within the flow.
//! 2. Every `on_success` / `on_failure` edge must reference an existing step.
//! 3. The directed graph must be acyclic (DFS with a recursion-stack set).
//!
//! Returns a topologically-sorted list of step IDs on success.

use std::collections::{HashMap, HashSet};

use crate::{models::FlowDefinition, EngineError};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the current recursion stack.
    Visiting,
    Done,
}

struct Walk<'a> {
    adjacency: HashMap<&'a str, Vec<&'a str>>,
    marks: HashMap<&'a str, Mark>,
    stack: Vec<&'a str>,
    postorder: Vec<&'a str>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, id: &'a str) -> Result<(), EngineError> {
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(|s| (*s).to_owned()).collect();
                path.push(id.to_owned());
                return Err(EngineError::CycleDetected { path });
            }
            None => {}
        }

        self.marks.insert(id, Mark::Visiting);
        self.stack.push(id);
        let next = self.adjacency.get(id).cloned().unwrap_or_default();
        for target in next {
            self.visit(target)?;
        }
        self.stack.pop();
        self.marks.insert(id, Mark::Done);
        self.postorder.push(id);
        Ok(())
    }
}

/// Validate the flow graph and return steps in topological execution order.
///
/// # Errors
/// - [`EngineError::EmptyFlow`] if the flow has no steps.
/// - [`EngineError::DuplicateStepId`] if two steps share an ID.
/// - [`EngineError::UnknownStepReference`] if an edge references a missing step.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_flow(flow: &FlowDefinition) -> Result<Vec<String>, EngineError> {
    if flow.steps.is_empty() {
        return Err(EngineError::EmptyFlow);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure step IDs are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &flow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge targets and build the adjacency list
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &flow.steps {
        let edges = step
            .on_success
            .iter()
            .map(|t| (t, "on_success"))
            .chain(step.on_failure.iter().map(|t| (t, "on_failure")));
        let targets = adjacency.entry(step.id.as_str()).or_default();
        for (target, edge) in edges {
            if !seen_ids.contains(target.as_str()) {
                return Err(EngineError::UnknownStepReference {
                    step_id: step.id.clone(),
                    target: target.clone(),
                    edge,
                });
            }
            targets.push(target.as_str());
        }
    }

    // -----------------------------------------------------------------------
    // 3. DFS in declaration order; reversed postorder is a topological order
    // -----------------------------------------------------------------------
    let mut walk = Walk {
        adjacency,
        marks: HashMap::new(),
        stack: Vec::new(),
        postorder: Vec::with_capacity(flow.steps.len()),
    };
    for step in &flow.steps {
        walk.visit(step.id.as_str())?;
    }

    Ok(walk.postorder.iter().rev().map(|s| (*s).to_owned()).collect())
}

/// Steps no edge points at. These are ready as soon as the execution starts.
pub fn entry_steps(flow: &FlowDefinition) -> Vec<String> {
    let targets: HashSet<&str> = flow
        .steps
        .iter()
        .flat_map(|s| s.on_success.iter().chain(s.on_failure.iter()))
        .map(String::as_str)
        .collect();
    flow.steps
        .iter()
        .filter(|s| !targets.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepDefinition;

    fn make_step(id: &str) -> StepDefinition {
        StepDefinition::new(id, "mock")
    }

    fn make_flow(steps: Vec<StepDefinition>) -> FlowDefinition {
        FlowDefinition::new("test", steps)
    }

    #[test]
    fn valid_linear_flow_returns_sorted_order() {
        // A → B → C
        let flow = make_flow(vec![
            make_step("a").then("b"),
            make_step("b").then("c"),
            make_step("c"),
        ]);

        let sorted = validate_flow(&flow).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let flow = make_flow(vec![
            make_step("c"),
            make_step("b").then("c"),
            make_step("a").then("b"),
        ]);

        let sorted = validate_flow(&flow).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_flow() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let flow = make_flow(vec![
            make_step("a").then("b").then("c"),
            make_step("b").then("d"),
            make_step("c").then("d"),
            make_step("d"),
        ]);

        let sorted = validate_flow(&flow).expect("should be valid");
        assert_eq!(sorted.first().unwrap(), "a");
        assert_eq!(sorted.last().unwrap(), "d");
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn failure_edges_are_part_of_the_graph() {
        let flow = make_flow(vec![
            make_step("charge").then("ship").on_failure("refund"),
            make_step("ship"),
            make_step("refund"),
        ]);

        let sorted = validate_flow(&flow).expect("should be valid");
        assert_eq!(sorted[0], "charge");
        assert_eq!(entry_steps(&flow), vec!["charge"]);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let flow = make_flow(vec![make_step("a"), make_step("a")]);
        assert!(matches!(
            validate_flow(&flow),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_step_is_rejected() {
        let flow = make_flow(vec![make_step("a").on_failure("ghost")]);
        assert!(matches!(
            validate_flow(&flow),
            Err(EngineError::UnknownStepReference { target, edge, .. })
                if target == "ghost" && edge == "on_failure"
        ));
    }

    #[test]
    fn cycle_is_detected_with_its_path() {
        // A → B → C → A
        let flow = make_flow(vec![
            make_step("a").then("b"),
            make_step("b").then("c"),
            make_step("c").then("a"),
        ]);
        match validate_flow(&flow) {
            Err(EngineError::CycleDetected { path }) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let flow = make_flow(vec![make_step("retry").on_failure("retry")]);
        assert!(matches!(
            validate_flow(&flow),
            Err(EngineError::CycleDetected { .. })
        ));
    }

    #[test]
    fn empty_flow_is_rejected() {
        assert!(matches!(
            validate_flow(&make_flow(vec![])),
            Err(EngineError::EmptyFlow)
        ));
    }

    #[test]
    fn single_step_is_valid() {
        let flow = make_flow(vec![make_step("solo")]);
        let sorted = validate_flow(&flow).expect("single step should be valid");
        assert_eq!(sorted, vec!["solo"]);
    }
}
