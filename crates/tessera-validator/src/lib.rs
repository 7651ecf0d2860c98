//! Validation pipeline for function models.
//!
//! Five independent passes (structural, business rules, execution readiness,
//! context integrity, cross-feature) fold into one [`ValidationReport`]. A
//! [`ValidationLevel`] selects which passes run. [`validate_workflow`] is the
//! structural subset used as the publish gate.

pub mod catalog;
pub mod graph;
pub mod passes;
pub mod pipeline;
pub mod report;

pub use catalog::{ModelSummary, ReferenceCatalog};
pub use graph::DependencyGraph;
pub use passes::ValidationPass;
pub use pipeline::{validate_workflow, ValidationContext, ValidationPipeline};
pub use report::{PassKind, PassReport, ValidationIssue, ValidationLevel, ValidationReport};
