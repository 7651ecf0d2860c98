use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use tessera_core::audit::{ops, AuditEntry};
use tessera_core::config::LinkAnalysisConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::{CrossFeatureLink, FeatureRef, LinkType, NodeLinkContext};
use tessera_core::traits::{AuditSink, LinkRepository};
use tessera_core::types::{LinkId, UserId};

use crate::cycles::{CycleDetector, CycleReport};
use crate::graph::LinkGraph;
use crate::strength::{StrengthBreakdown, StrengthOptions, StrengthScorer, StrengthSignals};

/// Creates, removes and analyzes cross-feature links.
pub struct LinkService {
    links: Arc<dyn LinkRepository>,
    event_bus: Arc<EventBus>,
    audit: Option<Arc<dyn AuditSink>>,
    detector: CycleDetector,
    scorer: StrengthScorer,
    interactions: Mutex<HashMap<LinkId, u64>>,
}

impl LinkService {
    pub fn new(
        links: Arc<dyn LinkRepository>,
        event_bus: Arc<EventBus>,
        config: &LinkAnalysisConfig,
    ) -> Self {
        Self {
            links,
            event_bus,
            audit: None,
            detector: CycleDetector::new(config.max_cycle_length),
            scorer: StrengthScorer::new(config),
            interactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn repository(&self) -> &Arc<dyn LinkRepository> {
        &self.links
    }

    pub async fn create_link(
        &self,
        source: FeatureRef,
        target: FeatureRef,
        link_type: LinkType,
        strength: f64,
        node_context: Option<NodeLinkContext>,
        user: &UserId,
    ) -> Result<CrossFeatureLink> {
        let mut link = CrossFeatureLink::new(source, target, link_type, strength)?;
        if let Some(context) = node_context {
            link = link.with_node_context(context);
        }

        let key = link.uniqueness_key();
        let existing = self.links.find_by_entity(&link.source).await?;
        if existing.iter().any(|l| l.uniqueness_key() == key) {
            return Err(TesseraError::InvalidLink(format!(
                "a link from {} to {} already exists",
                link.source, link.target
            )));
        }

        self.links.save(link.clone()).await?;
        info!(
            link_id = %link.id,
            source = %link.source,
            target = %link.target,
            link_type = %link.link_type,
            "Cross-feature link created"
        );

        self.record(
            AuditEntry::new(ops::LINK_CREATED, link.id.as_str(), user).with_details(
                serde_json::json!({
                    "source": link.source.to_string(),
                    "target": link.target.to_string(),
                    "link_type": link.link_type,
                    "strength": link.strength,
                }),
            ),
        )
        .await;
        self.event_bus.publish(DomainEvent::CrossFeatureLinkCreated {
            link_id: link.id.clone(),
            source: link.source.clone(),
            target: link.target.clone(),
            link_type: link.link_type,
        });
        Ok(link)
    }

    pub async fn delete_link(&self, id: &LinkId, user: &UserId) -> Result<()> {
        if !self.links.delete(id).await? {
            return Err(TesseraError::LinkNotFound(id.to_string()));
        }
        if let Ok(mut interactions) = self.interactions.lock() {
            interactions.remove(id);
        }
        info!(link_id = %id, "Cross-feature link deleted");

        self.record(AuditEntry::new(ops::LINK_DELETED, id.as_str(), user)).await;
        self.event_bus
            .publish(DomainEvent::CrossFeatureLinkDeleted { link_id: id.clone() });
        Ok(())
    }

    pub async fn get_link(&self, id: &LinkId) -> Result<CrossFeatureLink> {
        self.links
            .find_by_id(id)
            .await?
            .ok_or_else(|| TesseraError::LinkNotFound(id.to_string()))
    }

    /// Links whose source or target is `entity`.
    pub async fn links_for(&self, entity: &FeatureRef) -> Result<Vec<CrossFeatureLink>> {
        self.links.find_by_entity(entity).await
    }

    pub async fn list_links(&self) -> Result<Vec<CrossFeatureLink>> {
        self.links.find_all().await
    }

    /// Run cycle detection over every stored link and publish the summary.
    pub async fn detect_cycles(&self) -> Result<CycleReport> {
        let links = self.links.find_all().await?;
        let report = self.detector.detect(&LinkGraph::from_links(&links));

        if report.has_cycles() {
            warn!(
                total_cycles = report.total_cycles,
                max_strength_product = report.max_strength_product,
                "Cycles detected in link graph"
            );
        } else {
            debug!(links = links.len(), "Link graph is acyclic");
        }

        self.event_bus.publish(DomainEvent::CyclesDetected {
            total_cycles: report.total_cycles,
            average_cycle_length: report.average_cycle_length,
            max_strength_product: report.max_strength_product,
            warnings: report.warnings.clone(),
        });
        Ok(report)
    }

    /// Count one traversal of a link; feeds the frequency bonus.
    pub fn record_interaction(&self, id: &LinkId) -> u64 {
        match self.interactions.lock() {
            Ok(mut interactions) => {
                let count = interactions.entry(id.clone()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 0,
        }
    }

    fn interaction_count(&self, id: &LinkId) -> u64 {
        self.interactions
            .lock()
            .ok()
            .and_then(|i| i.get(id).copied())
            .unwrap_or(0)
    }

    /// Recompute a link's strength from its stored base plus the enabled
    /// bonuses, persist it, and publish `LinkStrengthUpdated`.
    pub async fn recalculate_strength(
        &self,
        id: &LinkId,
        options: StrengthOptions,
        mut signals: StrengthSignals,
        user: &UserId,
    ) -> Result<StrengthBreakdown> {
        let mut link = self.get_link(id).await?;
        signals.interaction_count = signals.interaction_count.max(self.interaction_count(id));

        // Score from the base so repeated recalculations do not stack bonuses.
        let base = *link.base_strength.get_or_insert(link.strength);
        let breakdown = self.scorer.score(base, &signals, options);
        let previous_strength = link.strength;
        link.set_strength(breakdown.final_strength)?;
        self.links.save(link).await?;

        info!(
            link_id = %id,
            previous_strength,
            new_strength = breakdown.final_strength,
            "Link strength updated"
        );
        self.record(
            AuditEntry::new(ops::LINK_STRENGTH_UPDATED, id.as_str(), user).with_details(
                serde_json::json!({
                    "previous_strength": previous_strength,
                    "new_strength": breakdown.final_strength,
                }),
            ),
        )
        .await;
        self.event_bus.publish(DomainEvent::LinkStrengthUpdated {
            link_id: id.clone(),
            previous_strength,
            new_strength: breakdown.final_strength,
        });
        Ok(breakdown)
    }

    async fn record(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.save(entry).await {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }
}
