use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{info, warn};

use tessera_core::error::{ActionFailure, ErrorType, Result, TesseraError};
use tessera_core::model::NestedModelConfig;
use tessera_core::traits::{ActionOutput, ActionRequest};
use tessera_core::types::ModelId;

use crate::orchestrator::{Run, RunParams, WorkflowOrchestrator};
use crate::plan::ExecutionPlan;

/// Chain of models on the current nesting path. Refuses to enter a model
/// already on the path or to go deeper than the configured limit.
#[derive(Debug, Clone)]
pub struct NestingGuard {
    max_depth: usize,
    path: Vec<ModelId>,
}

impl NestingGuard {
    pub fn root(model: &ModelId, max_depth: usize) -> Self {
        Self {
            max_depth,
            path: vec![model.clone()],
        }
    }

    /// 0 for a top-level run.
    pub fn depth(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn enter(&self, child: &ModelId) -> Result<NestingGuard> {
        if self.path.contains(child) {
            let mut cycle: Vec<&str> = self.path.iter().map(|m| m.as_str()).collect();
            cycle.push(child.as_str());
            return Err(TesseraError::CycleDetected(format!(
                "nested models call each other: {}",
                cycle.join(" -> ")
            )));
        }
        if self.depth() + 1 > self.max_depth {
            return Err(TesseraError::NestingTooDeep(self.max_depth));
        }
        let mut path = self.path.clone();
        path.push(child.clone());
        Ok(Self {
            max_depth: self.max_depth,
            path,
        })
    }
}

/// Child input map: only parent keys named in the mapping cross over,
/// renamed to their child key.
pub fn map_inputs(cfg: &NestedModelConfig, parent: &Map<String, Value>) -> Map<String, Value> {
    cfg.input_mapping
        .iter()
        .filter_map(|(parent_key, child_key)| {
            parent.get(parent_key).map(|v| (child_key.clone(), v.clone()))
        })
        .collect()
}

/// Parent-side output: only child outputs named in the reverse mapping
/// come back, renamed to their parent key.
pub fn map_outputs(cfg: &NestedModelConfig, child: &Map<String, Value>) -> ActionOutput {
    ActionOutput {
        values: cfg
            .output_mapping
            .iter()
            .filter_map(|(child_key, parent_key)| {
                child.get(child_key).map(|v| (parent_key.clone(), v.clone()))
            })
            .collect(),
    }
}

impl WorkflowOrchestrator {
    /// One attempt of a nested-model action: a full child run whose root
    /// context holds only the mapped inputs already in `request.inputs`.
    pub(crate) fn run_nested<'a>(
        &'a self,
        parent: &'a Run,
        request: ActionRequest,
    ) -> BoxFuture<'a, std::result::Result<ActionOutput, ActionFailure>> {
        Box::pin(async move {
            let Some(cfg) = request.action.kind.nested_model() else {
                return Err(ActionFailure::configuration(format!(
                    "action '{}' does not reference a nested model",
                    request.action.id
                )));
            };

            let guard = parent
                .guard
                .enter(&cfg.model_id)
                .map_err(|e| ActionFailure::configuration(e.to_string()))?;
            let child = self
                .load_runnable(&cfg.model_id)
                .await
                .map_err(|e| ActionFailure::configuration(e.to_string()))?;
            let plan = ExecutionPlan::build(&child).map_err(|e| ActionFailure::configuration(e.to_string()))?;

            info!(
                execution_id = %parent.id,
                action_id = %request.action.id,
                child_model = %child.id,
                depth = guard.depth(),
                "Entering nested model"
            );

            let record = self
                .run(RunParams {
                    model: child,
                    plan,
                    mode: parent.mode,
                    input: request.inputs.clone(),
                    user: parent.user.clone(),
                    guard,
                    parent: Some(parent.id.clone()),
                    cancel: parent.cancel.child_token(),
                })
                .await;

            let state = record.state;
            let child_error = record.error.clone();
            let output = map_outputs(cfg, &record.outputs);
            parent.progress().children.push(record);

            if state.is_success() {
                Ok(output)
            } else {
                warn!(
                    execution_id = %parent.id,
                    child_model = %cfg.model_id,
                    state = %state,
                    "Nested model failed"
                );
                Err(ActionFailure::fatal(
                    ErrorType::CascadeFailure,
                    format!(
                        "nested model '{}' ended {}: {}",
                        cfg.model_id,
                        state,
                        child_error.unwrap_or_default()
                    ),
                ))
            }
        })
    }
}
