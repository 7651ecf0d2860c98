pub mod business;
pub mod context;
pub mod cross_feature;
pub mod readiness;
pub mod structural;

use tessera_core::error::Result;
use tessera_core::model::{ActionKind, ActionMode, ActionNode, ContextBinding, FunctionModel};
use tessera_core::types::NodeId;

use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport};

pub use business::BusinessRulesPass;
pub use context::ContextIntegrityPass;
pub use cross_feature::CrossFeaturePass;
pub use readiness::ExecutionReadinessPass;
pub use structural::StructuralPass;

/// One independently runnable validation pass.
pub trait ValidationPass: Send + Sync {
    fn kind(&self) -> PassKind;

    /// Inspect `model`. An `Err` means the pass itself could not run; the
    /// pipeline records it as an error of this pass.
    fn run(&self, model: &FunctionModel, ctx: &ValidationContext) -> Result<PassReport>;
}

/// Active actions of a container grouped into execution steps.
///
/// Actions run in `(execution_order, declaration)` order. Consecutive
/// parallel-mode actions sharing an execution order form one step whose
/// members run concurrently; every other action is a step of its own.
pub fn action_steps<'a>(model: &'a FunctionModel, node: &NodeId) -> Vec<Vec<&'a ActionNode>> {
    let mut actions: Vec<(usize, &ActionNode)> = model
        .actions
        .iter()
        .enumerate()
        .filter(|(_, a)| &a.node_id == node && a.is_active())
        .collect();
    actions.sort_by_key(|(i, a)| (a.execution_order, *i));

    let mut steps: Vec<Vec<&ActionNode>> = Vec::new();
    for (_, action) in actions {
        let joins_previous = action.mode == ActionMode::Parallel
            && steps.last().is_some_and(|step| {
                step.iter().all(|a| {
                    a.mode == ActionMode::Parallel && a.execution_order == action.execution_order
                })
            });
        match steps.last_mut() {
            Some(step) if joins_previous => step.push(action),
            _ => steps.push(vec![action]),
        }
    }
    steps
}

/// Context keys an action reads: declared inputs plus mapped parent keys.
pub fn action_reads(action: &ActionNode) -> Vec<ContextBinding> {
    let mut reads = action.inputs.clone();
    if let ActionKind::FunctionModel(cfg) = &action.kind {
        for parent_key in cfg.input_mapping.keys() {
            if !reads.iter().any(|b| &b.key == parent_key) {
                reads.push(ContextBinding::new(parent_key.clone()));
            }
        }
    }
    reads
}

/// Context keys an action writes: declared outputs plus mapped parent keys.
pub fn action_writes(action: &ActionNode) -> Vec<ContextBinding> {
    let mut writes = action.outputs.clone();
    if let ActionKind::FunctionModel(cfg) = &action.kind {
        for parent_key in cfg.output_mapping.values() {
            if !writes.iter().any(|b| &b.key == parent_key) {
                writes.push(ContextBinding::new(parent_key.clone()));
            }
        }
    }
    writes
}
