//! Cross-feature link graph analysis.
//!
//! Links between entities of different features (function models, knowledge
//! bases, spindles, event storms) form a directed graph. This crate finds
//! cycles in that graph before they can loop at runtime, scores link
//! strength, and wraps both behind a [`LinkService`] that persists links and
//! publishes domain events.

pub mod cycles;
pub mod graph;
pub mod service;
pub mod strength;

pub use cycles::{CycleDetector, CycleKind, CycleReport, LinkCycle};
pub use graph::{LinkEdge, LinkGraph};
pub use service::LinkService;
pub use strength::{StrengthBreakdown, StrengthOptions, StrengthSignals, StrengthScorer};
