//! Branching and merging (spec §4.5, components C5 + the three-way merge
//! algorithm of §4.5a).

pub mod manager;
pub mod merge;

pub use manager::{
    cherry_pick, execute_merge, find_common_ancestor, fork, get_merge_history, preview_merge,
    MergeHistoryEntry, MergePreview,
};
pub use merge::{apply_changes, three_way_merge, ConflictKind, ConflictResolution, EntityMergeOutcome, MergeConflict};
