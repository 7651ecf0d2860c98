use tracing::{debug, warn};

use tessera_core::model::FunctionModel;
use tessera_core::types::UserId;

use crate::catalog::ReferenceCatalog;
use crate::passes::{
    BusinessRulesPass, ContextIntegrityPass, CrossFeaturePass, ExecutionReadinessPass,
    StructuralPass, ValidationPass,
};
use crate::report::{PassReport, ValidationLevel, ValidationReport};

/// Inputs a validation call shares across passes.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// User the validation runs for; permission checks are skipped when unset.
    pub user: Option<UserId>,
    pub catalog: ReferenceCatalog,
    pub max_cycle_length: usize,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            user: None,
            catalog: ReferenceCatalog::default(),
            max_cycle_length: 10,
        }
    }
}

/// Ordered set of passes folded into one report.
pub struct ValidationPipeline {
    passes: Vec<Box<dyn ValidationPass>>,
}

impl ValidationPipeline {
    pub fn empty() -> Self {
        Self { passes: Vec::new() }
    }

    /// All five passes in their canonical order.
    pub fn standard() -> Self {
        Self::empty()
            .with_pass(StructuralPass)
            .with_pass(BusinessRulesPass)
            .with_pass(ExecutionReadinessPass)
            .with_pass(ContextIntegrityPass)
            .with_pass(CrossFeaturePass)
    }

    /// Add a pass; a later pass of the same kind replaces the earlier one.
    pub fn with_pass(mut self, pass: impl ValidationPass + 'static) -> Self {
        self.passes.retain(|p| p.kind() != pass.kind());
        self.passes.push(Box::new(pass));
        self
    }

    pub fn run(
        &self,
        model: &FunctionModel,
        level: ValidationLevel,
        ctx: &ValidationContext,
    ) -> ValidationReport {
        let mut report = ValidationReport::new(model.id.clone(), level);

        for pass in self.passes.iter().filter(|p| level.includes(p.kind())) {
            let kind = pass.kind();
            let result = match pass.run(model, ctx) {
                Ok(result) => result,
                Err(e) => {
                    warn!(model_id = %model.id, pass = %kind, error = %e, "Validation pass failed");
                    PassReport::failed(kind, e)
                }
            };
            debug!(
                model_id = %model.id,
                pass = %kind,
                errors = result.errors.len(),
                warnings = result.warnings.len(),
                "Validation pass finished"
            );
            report.record(kind, result);
        }

        report
    }
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

/// Publish gate: graph well-formedness and IO boundaries only.
pub fn validate_workflow(model: &FunctionModel) -> PassReport {
    StructuralPass::check(model)
}
