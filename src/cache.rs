//! The in-process cache described in spec §5 ("Shared resources"): holds
//! dependency graphs and computed-field snapshots. Strictly an
//! optimization — every entry can be dropped at any time and rebuilt from
//! the database, so it is a plain concurrent map rather than anything with
//! its own persistence or eviction policy.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::depgraph::DependencyGraph;

/// Cache key for a computed-field snapshot: `computed-fields:<entityType>:<entityId>:<branchId>`
/// (spec §5, verbatim key format).
pub fn computed_field_key(entity_type: &str, entity_id: Uuid, branch_id: Uuid) -> String {
    format!("computed-fields:{entity_type}:{entity_id}:{branch_id}")
}

#[derive(Default)]
pub struct Cache {
    graphs: DashMap<(Uuid, Uuid), Arc<DependencyGraph>>,
    computed_fields: DashMap<String, serde_json::Value>,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    pub fn get_graph(&self, campaign_id: Uuid, branch_id: Uuid) -> Option<Arc<DependencyGraph>> {
        self.graphs.get(&(campaign_id, branch_id)).map(|g| g.clone())
    }

    pub fn put_graph(&self, campaign_id: Uuid, branch_id: Uuid, graph: Arc<DependencyGraph>) {
        self.graphs.insert((campaign_id, branch_id), graph);
    }

    /// Drops every cached graph for a campaign, across all of its branches
    /// (spec §4.8 `invalidateGraph(campaignId)`).
    pub fn invalidate_graphs_for_campaign(&self, campaign_id: Uuid) {
        log::trace!("invalidating dependency graph cache for campaign {campaign_id}");
        self.graphs.retain(|(c, _), _| *c != campaign_id);
    }

    pub fn invalidate_graph(&self, campaign_id: Uuid, branch_id: Uuid) {
        log::trace!("invalidating dependency graph cache for {campaign_id}/{branch_id}");
        self.graphs.remove(&(campaign_id, branch_id));
    }

    pub fn get_computed_field(&self, key: &str) -> Option<serde_json::Value> {
        self.computed_fields.get(key).map(|v| v.clone())
    }

    pub fn put_computed_field(&self, key: String, value: serde_json::Value) {
        self.computed_fields.insert(key, value);
    }

    pub fn evict_computed_field(&self, key: &str) {
        log::trace!("evicting computed-field cache entry {key}");
        self.computed_fields.remove(key);
    }

    /// Evicts every computed-field entry for one entity across all
    /// branches, used when an update's branch isn't known in advance.
    pub fn evict_computed_fields_for_entity(&self, entity_type: &str, entity_id: Uuid) {
        let prefix = format!("computed-fields:{entity_type}:{entity_id}:");
        self.computed_fields.retain(|k, _| !k.starts_with(&prefix));
    }
}
