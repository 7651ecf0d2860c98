use std::collections::{HashMap, HashSet};

use tessera_core::error::Result;
use tessera_core::model::{ContextBinding, FunctionModel, ValueType};
use tessera_core::types::NodeId;

use crate::graph::DependencyGraph;
use crate::passes::{action_reads, action_steps, action_writes, ValidationPass};
use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport, ValidationIssue};

/// Read-before-write, producer/consumer types and scope inheritance, checked
/// by walking the nodes in execution order.
pub struct ContextIntegrityPass;

type Produced = HashMap<NodeId, HashMap<String, ValueType>>;

impl ValidationPass for ContextIntegrityPass {
    fn kind(&self) -> PassKind {
        PassKind::Context
    }

    fn run(&self, model: &FunctionModel, _ctx: &ValidationContext) -> Result<PassReport> {
        let graph = DependencyGraph::from_model(model);
        let order = graph.stable_order()?;
        let ancestors: HashMap<NodeId, HashSet<NodeId>> = order
            .iter()
            .map(|id| (id.clone(), graph.ancestors(id)))
            .collect();

        let mut report = PassReport::new();
        let mut produced: Produced = HashMap::new();

        for id in &order {
            let Some(node) = model.node(id) else {
                continue;
            };
            let scope = Scope {
                model,
                node: id,
                ancestors: &ancestors,
                produced: &produced,
            };
            let mut local: HashMap<String, ValueType> = HashMap::new();

            if node.is_input_capable() {
                for field in node.fields() {
                    local.insert(field.key.clone(), field.value_type);
                }
            }

            for step in action_steps(model, id) {
                for action in &step {
                    for read in action_reads(action) {
                        scope.check_read(
                            &read,
                            &local,
                            &format!("Action '{}'", action.name),
                            &action.id.to_string(),
                            &mut report,
                        );
                    }
                }

                let mut step_writes: HashMap<String, &str> = HashMap::new();
                for action in &step {
                    for write in action_writes(action) {
                        if let Some(other) = step_writes.insert(write.key.clone(), action.id.as_str()) {
                            report.error(
                                ValidationIssue::new(
                                    "CONFLICTING_WRITE",
                                    format!(
                                        "Parallel actions '{}' and '{}' both write '{}'",
                                        other, action.id, write.key
                                    ),
                                )
                                .on(&action.id),
                            );
                        }
                        if !scope.producers(&write.key).is_empty() {
                            report.warn(
                                ValidationIssue::new(
                                    "SHADOWED_KEY",
                                    format!(
                                        "Action '{}' writes '{}', hiding the upstream value from later nodes",
                                        action.name, write.key
                                    ),
                                )
                                .on(&action.id),
                            );
                        }
                        local.insert(write.key.clone(), write.value_type);
                    }
                }
            }

            if node.is_output_capable() && !node.is_input_capable() {
                for field in node.fields() {
                    scope.check_read(
                        field,
                        &local,
                        &format!("Output boundary '{}'", node.name),
                        id.as_str(),
                        &mut report,
                    );
                }
            }

            produced.insert(id.clone(), local);
        }

        Ok(report)
    }
}

struct Scope<'a> {
    model: &'a FunctionModel,
    node: &'a NodeId,
    ancestors: &'a HashMap<NodeId, HashSet<NodeId>>,
    produced: &'a Produced,
}

impl Scope<'_> {
    /// Nearest upstream producers of `key`: ancestors writing it that are
    /// not themselves hidden by a later ancestor writing it too.
    fn producers(&self, key: &str) -> Vec<(&NodeId, ValueType)> {
        let Some(upstream) = self.ancestors.get(self.node) else {
            return Vec::new();
        };
        let writers: Vec<(&NodeId, ValueType)> = self
            .model
            .nodes
            .iter()
            .filter(|n| upstream.contains(&n.id))
            .filter_map(|n| {
                self.produced
                    .get(&n.id)
                    .and_then(|keys| keys.get(key))
                    .map(|t| (&n.id, *t))
            })
            .collect();

        writers
            .iter()
            .filter(|(w, _)| {
                !writers.iter().any(|(other, _)| {
                    other != w
                        && self
                            .ancestors
                            .get(*other)
                            .is_some_and(|anc| anc.contains(*w))
                })
            })
            .copied()
            .collect()
    }

    fn check_read(
        &self,
        read: &ContextBinding,
        local: &HashMap<String, ValueType>,
        who: &str,
        entity: &str,
        report: &mut PassReport,
    ) {
        let producer_type = match local.get(&read.key) {
            Some(t) => *t,
            None => {
                let producers = self.producers(&read.key);
                match producers.as_slice() {
                    [] => {
                        report.error(
                            ValidationIssue::new(
                                "READ_BEFORE_WRITE",
                                format!("{} reads '{}' before anything upstream writes it", who, read.key),
                            )
                            .on(entity),
                        );
                        return;
                    }
                    [(_, t)] => *t,
                    [(_, t), ..] => {
                        let names: Vec<&str> = producers.iter().map(|(n, _)| n.as_str()).collect();
                        report.warn(
                            ValidationIssue::new(
                                "AMBIGUOUS_READ",
                                format!(
                                    "{} reads '{}', written by independent nodes {}",
                                    who,
                                    read.key,
                                    names.join(", ")
                                ),
                            )
                            .on(entity),
                        );
                        *t
                    }
                }
            }
        };

        if !producer_type.accepts(read.value_type) {
            report.error(
                ValidationIssue::new(
                    "TYPE_MISMATCH",
                    format!(
                        "{} expects '{}' as {:?} but it is produced as {:?}",
                        who, read.key, read.value_type, producer_type
                    ),
                )
                .on(entity),
            );
        }
    }
}
