//! Dependency Graph (spec §4.8, component C8).
//!
//! Derived variables reference each other through `{"var": "variables.<key>"}`
//! paths in their formula. This module builds the directed graph of those
//! references per `(campaign, branch)`, detects cycles so a formula update
//! can be rejected before it's saved, and answers "what needs to be
//! recomputed if this variable changes" for cache invalidation.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use serde_json::Value;
use uuid::Uuid;

use crate::entity::StateVariable;

const VARIABLE_REF_PREFIX: &str = "variables.";

/// A directed graph over state-variable ids: an edge `a -> b` means "a's
/// formula reads b". Built fresh per `(campaign, branch)` and cached
/// (spec §5); callers never mutate a cached instance in place, they build a
/// new one and swap it in.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: StableGraph<Uuid, ()>,
    index_of: HashMap<Uuid, NodeIndex>,
}

impl DependencyGraph {
    pub fn empty() -> Self {
        DependencyGraph { graph: StableGraph::new(), index_of: HashMap::new() }
    }

    /// Builds the graph for one `(campaign, branch)` scope from its
    /// variables. Variables without formulas are included as isolated nodes
    /// so they still participate in lookups.
    pub fn build(variables: &[StateVariable]) -> Self {
        let mut dg = DependencyGraph::empty();
        for v in variables {
            dg.ensure_node(v.id);
        }
        for v in variables {
            let Some(formula) = &v.formula else { continue };
            for referenced_key in extract_variable_refs(formula) {
                if let Some(target) = variables.iter().find(|other| other.key == referenced_key) {
                    dg.add_dependency(v.id, target.id);
                }
            }
        }
        dg
    }

    fn ensure_node(&mut self, id: Uuid) -> NodeIndex {
        *self.index_of.entry(id).or_insert_with(|| self.graph.add_node(id))
    }

    pub fn add_dependency(&mut self, dependent: Uuid, dependency: Uuid) {
        let a = self.ensure_node(dependent);
        let b = self.ensure_node(dependency);
        self.graph.update_edge(a, b, ());
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index_of.contains_key(&id)
    }

    /// Returns the member ids of every cycle (Tarjan SCC: any strongly
    /// connected component with more than one node, or a single node with a
    /// self-loop, is a cycle). A graph can have more than one disjoint
    /// cycle, so every qualifying SCC is collected rather than stopping at
    /// the first.
    pub fn find_cycles(&self) -> Vec<Vec<Uuid>> {
        let mut cycles = Vec::new();
        for scc in petgraph::algo::tarjan_scc(&self.graph) {
            if scc.len() > 1 {
                cycles.push(scc.into_iter().map(|idx| self.graph[idx]).collect());
            } else if let [only] = scc[..] {
                if self.graph.find_edge(only, only).is_some() {
                    cycles.push(vec![self.graph[only]]);
                }
            }
        }
        cycles
    }

    pub fn validate_no_cycles(&self) -> Result<(), Vec<Vec<Uuid>>> {
        let cycles = self.find_cycles();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(cycles)
        }
    }

    /// Every variable that transitively depends on `id` — i.e. every node
    /// reachable by walking edges backwards from it. Used to know which
    /// computed-field cache entries to evict when `id` changes.
    pub fn find_transitive_dependents(&self, id: Uuid) -> Vec<Uuid> {
        let Some(&start) = self.index_of.get(&id) else { return Vec::new() };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(node) = queue.pop_front() {
            for edge in self.graph.edges_directed(node, petgraph::Direction::Incoming) {
                let dependent = edge.source();
                if seen.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        seen.into_iter().map(|idx| self.graph[idx]).collect()
    }

    /// Direct (non-transitive) dependencies of `id`, used to pre-check a
    /// formula edit against a would-be cycle before committing it.
    pub fn direct_dependencies(&self, id: Uuid) -> Vec<Uuid> {
        let Some(&idx) = self.index_of.get(&id) else { return Vec::new() };
        self.graph.edges_directed(idx, petgraph::Direction::Outgoing).map(|e| self.graph[e.target()]).collect()
    }
}

/// Walks a formula's JSON looking for `{"var": "variables.<key>"}`
/// references. Unrelated `var` paths (e.g. `"settlement.population"`)
/// address entity scope data, not other derived variables, and are not
/// graph edges.
fn extract_variable_refs(formula: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    walk(formula, &mut refs);
    refs
}

fn walk(node: &Value, refs: &mut Vec<String>) {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(path)) = map.get("var") {
                if let Some(key) = path.strip_prefix(VARIABLE_REF_PREFIX) {
                    refs.push(key.to_string());
                }
            }
            for v in map.values() {
                walk(v, refs);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, refs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::VariableType;
    use crate::entity::Scope;

    fn derived(key: &str, formula: Value) -> StateVariable {
        StateVariable {
            id: Uuid::new_v4(),
            scope: Scope::Campaign,
            scope_id: Some(Uuid::new_v4()),
            key: key.to_string(),
            var_type: VariableType::Derived,
            value: None,
            formula: Some(formula),
            description: None,
            is_active: true,
            version: 1,
            created_by: Uuid::new_v4(),
            updated_by: Some(Uuid::new_v4()),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn empty_graph_has_no_cycle() {
        assert!(DependencyGraph::empty().find_cycles().is_empty());
    }

    #[test]
    fn build_wires_edges_from_variable_refs() {
        let a = derived("a", serde_json::json!({"var": "variables.b"}));
        let b = derived("b", serde_json::json!(1));
        let graph = DependencyGraph::build(&[a.clone(), b.clone()]);

        assert_eq!(graph.direct_dependencies(a.id), vec![b.id]);
    }

    #[test]
    fn entity_scope_var_paths_are_not_graph_edges() {
        let a = derived("a", serde_json::json!({"var": "settlement.population"}));
        let graph = DependencyGraph::build(&[a.clone()]);
        assert!(graph.direct_dependencies(a.id).is_empty());
    }

    #[test]
    fn direct_cycle_between_two_variables_is_detected() {
        let a = derived("a", serde_json::json!({"var": "variables.b"}));
        let b = derived("b", serde_json::json!({"var": "variables.a"}));
        let graph = DependencyGraph::build(&[a, b]);
        assert_eq!(graph.find_cycles().len(), 1);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let a_id = Uuid::new_v4();
        let mut graph = DependencyGraph::empty();
        graph.add_dependency(a_id, a_id);
        assert_eq!(graph.find_cycles(), vec![vec![a_id]]);
    }

    #[test]
    fn two_disjoint_cycles_are_both_reported() {
        // a <-> b, independently c <-> d: two separate SCCs of size 2.
        let a = derived("a", serde_json::json!({"var": "variables.b"}));
        let b = derived("b", serde_json::json!({"var": "variables.a"}));
        let c = derived("c", serde_json::json!({"var": "variables.d"}));
        let d = derived("d", serde_json::json!({"var": "variables.c"}));
        let graph = DependencyGraph::build(&[a, b, c, d]);

        let cycles = graph.find_cycles();
        assert_eq!(cycles.len(), 2);
    }

    #[test]
    fn transitive_dependents_walk_backwards_through_the_chain() {
        // a -> b -> c ; changing c should invalidate both a and b.
        let a = derived("a", serde_json::json!({"var": "variables.b"}));
        let b = derived("b", serde_json::json!({"var": "variables.c"}));
        let c = derived("c", serde_json::json!(1));
        let graph = DependencyGraph::build(&[a.clone(), b.clone(), c.clone()]);

        let dependents = graph.find_transitive_dependents(c.id);
        assert!(dependents.contains(&a.id));
        assert!(dependents.contains(&b.id));
    }

    #[test]
    fn unknown_variable_has_no_dependents() {
        let graph = DependencyGraph::empty();
        assert!(graph.find_transitive_dependents(Uuid::new_v4()).is_empty());
    }
}
