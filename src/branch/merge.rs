//! Three-way merge algorithm (spec §4.5a).
//!
//! Pure, DB-free diffing logic: given an entity's snapshot at the common
//! ancestor, on the source branch, and on the target branch, classifies
//! every leaf path that changed on either side and flags the ones that
//! changed on both sides to a different result as conflicts. [`manager`]
//! owns fetching those three snapshots and applying the outcome; this
//! module only decides what the outcome *is*.

use serde_json::Value;
use uuid::Uuid;

use crate::codec::{self, Diff};
use crate::entity::EntityType;

/// How a leaf path diverged between the two branches relative to their
/// common ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Both sides changed the path to a different, non-empty value.
    BothModified,
    /// Both sides removed the path (not load-bearing for resolution, kept
    /// for audit visibility per spec §4.5a's conflict-kind enumeration).
    BothDeleted,
    /// Source modified the path; target removed it.
    ModifiedDeleted,
    /// Source removed the path; target modified it.
    DeletedModified,
}

impl ConflictKind {
    pub fn requires_resolution(self) -> bool {
        !matches!(self, ConflictKind::BothDeleted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub path: String,
    pub kind: ConflictKind,
    pub base_value: Option<Value>,
    pub source_value: Option<Value>,
    pub target_value: Option<Value>,
}

/// A caller-supplied answer to one conflict, matched back to it by
/// `(entity_type, entity_id, path)` (spec §4.5a: "resolutions are matched
/// to conflicts by identity and path, not by position").
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub path: String,
    pub value: Value,
}

/// The result of diffing one entity three ways: every leaf path to apply to
/// the target (source-only changes plus resolved conflicts) and whatever
/// conflicts remain unresolved.
#[derive(Debug, Clone, Default)]
pub struct EntityMergeOutcome {
    pub changes: Vec<(String, Value)>,
    pub unresolved: Vec<MergeConflict>,
}

impl EntityMergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// One flattened leaf change: `old` is `None` for an addition, `new` is
/// `None` for a removal.
struct LeafChange {
    old: Option<Value>,
    new: Option<Value>,
}

/// Runs the three-way merge for one entity. `base` is `None` when the
/// entity didn't exist at the common ancestor (it was created on one side
/// after the fork) — in that case every path the existing side added is
/// treated as an addition, never a conflict with a nonexistent base.
pub fn three_way_merge(
    entity_type: EntityType,
    entity_id: Uuid,
    base: Option<&Value>,
    source: &Value,
    target: &Value,
    resolutions: &[ConflictResolution],
) -> EntityMergeOutcome {
    let empty = Value::Object(Default::default());
    let base = base.unwrap_or(&empty);

    let source_changes = flatten(&codec::diff(base, source), "");
    let target_changes = flatten(&codec::diff(base, target), "");

    let mut outcome = EntityMergeOutcome::default();

    for (path, s_change) in &source_changes {
        match target_changes.get(path) {
            None => {
                // Only the source touched this path: carry its value over.
                if let Some(v) = &s_change.new {
                    outcome.changes.push((path.clone(), v.clone()));
                }
            }
            Some(t_change) => {
                if s_change.new == t_change.new {
                    // Both sides converged on the same outcome.
                    continue;
                }

                let kind = match (&s_change.new, &t_change.new) {
                    (None, None) => ConflictKind::BothDeleted,
                    (Some(_), None) => ConflictKind::ModifiedDeleted,
                    (None, Some(_)) => ConflictKind::DeletedModified,
                    (Some(_), Some(_)) => ConflictKind::BothModified,
                };

                if !kind.requires_resolution() {
                    continue;
                }

                let resolved = resolutions.iter().find(|r| {
                    r.entity_type == entity_type && r.entity_id == entity_id && r.path == *path
                });

                match resolved {
                    Some(r) => outcome.changes.push((path.clone(), r.value.clone())),
                    None => outcome.unresolved.push(MergeConflict {
                        entity_type,
                        entity_id,
                        path: path.clone(),
                        kind,
                        base_value: s_change.old.clone(),
                        source_value: s_change.new.clone(),
                        target_value: t_change.new.clone(),
                    }),
                }
            }
        }
    }

    outcome
}

fn flatten(diff: &Diff, prefix: &str) -> std::collections::BTreeMap<String, LeafChange> {
    let mut out = std::collections::BTreeMap::new();

    for (key, value) in &diff.added {
        out.insert(join(prefix, key), LeafChange { old: None, new: Some(value.clone()) });
    }
    for (key, value) in &diff.removed {
        out.insert(join(prefix, key), LeafChange { old: Some(value.clone()), new: None });
    }
    for (key, value) in &diff.modified {
        let path = join(prefix, key);
        if let Ok(nested) = serde_json::from_value::<Diff>(value.clone()) {
            out.extend(flatten(&nested, &path));
        } else if let Some(obj) = value.as_object() {
            out.insert(path, LeafChange { old: obj.get("old").cloned(), new: obj.get("new").cloned() });
        }
    }

    out
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Applies a list of `(path, value)` leaf changes on top of a snapshot.
pub fn apply_changes(base: &Value, changes: &[(String, Value)]) -> Value {
    let mut result = base.clone();
    for (path, value) in changes {
        set_path(&mut result, path, value.clone());
    }
    result
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_path_segments(root, &segments, value);
}

fn set_path_segments(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else { return };

    if !node.is_object() {
        *node = Value::Object(Default::default());
    }
    let obj = node.as_object_mut().expect("just coerced to an object");

    if rest.is_empty() {
        obj.insert(head.to_string(), value);
    } else {
        let child = obj.entry(head.to_string()).or_insert_with(|| Value::Object(Default::default()));
        set_path_segments(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settlement(population: i64) -> Value {
        serde_json::json!({"name": "Ford", "population": population})
    }

    #[test]
    fn source_only_change_is_auto_applied() {
        let base = settlement(1000);
        let source = settlement(1200);
        let target = settlement(1000);

        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), Some(&base), &source, &target, &[]);
        assert!(outcome.is_clean());
        assert_eq!(outcome.changes, vec![("population".to_string(), serde_json::json!(1200))]);
    }

    #[test]
    fn target_only_change_needs_no_patch() {
        let base = settlement(1000);
        let source = settlement(1000);
        let target = settlement(900);

        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), Some(&base), &source, &target, &[]);
        assert!(outcome.is_clean());
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn convergent_change_on_both_sides_is_not_a_conflict() {
        let base = settlement(1000);
        let source = settlement(1500);
        let target = settlement(1500);

        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), Some(&base), &source, &target, &[]);
        assert!(outcome.is_clean());
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn divergent_change_on_both_sides_is_a_conflict() {
        let base = settlement(1000);
        let source = settlement(1500);
        let target = settlement(900);

        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), Some(&base), &source, &target, &[]);
        assert_eq!(outcome.unresolved.len(), 1);
        assert_eq!(outcome.unresolved[0].kind, ConflictKind::BothModified);
    }

    #[test]
    fn supplied_resolution_clears_the_conflict() {
        let base = settlement(1000);
        let source = settlement(1500);
        let target = settlement(900);
        let entity_id = Uuid::new_v4();

        let resolutions = vec![ConflictResolution {
            entity_type: EntityType::Settlement,
            entity_id,
            path: "population".to_string(),
            value: serde_json::json!(1300),
        }];

        let outcome = three_way_merge(EntityType::Settlement, entity_id, Some(&base), &source, &target, &resolutions);
        assert!(outcome.is_clean());
        assert_eq!(outcome.changes, vec![("population".to_string(), serde_json::json!(1300))]);
    }

    #[test]
    fn modified_then_deleted_is_flagged_with_the_right_kind() {
        let base = serde_json::json!({"name": "Ford", "mayor": "Alys"});
        let source = serde_json::json!({"name": "Ford", "mayor": "Bren"});
        let target = serde_json::json!({"name": "Ford"});

        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), Some(&base), &source, &target, &[]);
        assert_eq!(outcome.unresolved.len(), 1);
        assert_eq!(outcome.unresolved[0].kind, ConflictKind::ModifiedDeleted);
    }

    #[test]
    fn apply_changes_writes_back_into_the_snapshot() {
        let base = settlement(1000);
        let result = apply_changes(&base, &[("population".to_string(), serde_json::json!(2000))]);
        assert_eq!(result["population"], serde_json::json!(2000));
    }

    #[test]
    fn missing_base_entity_treats_shared_fields_as_additions_not_conflicts() {
        let source = settlement(500);
        let target = settlement(500);
        let outcome = three_way_merge(EntityType::Settlement, Uuid::nil(), None, &source, &target, &[]);
        assert!(outcome.is_clean());
    }
}
