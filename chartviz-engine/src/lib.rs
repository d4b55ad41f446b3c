//! Clinical timeline aggregation: stores, relevance expansion, rollups and dashboard tabs.

pub mod embedding;
pub mod problems;
pub mod relevance;
pub mod rollup;
pub mod store;
pub mod tabs;

pub use embedding::{disjoin, EmbeddingIndex, Neighbor, NeighborTable, VectorIndex, VocabToken};
pub use problems::{problem_list, Problem};
pub use relevance::{Expansion, RelevanceExpander};
pub use rollup::{
    rollup_chapters, rollup_cpts, rollup_labs, rollup_meds, ChapterRollup, CptRollup, IcdBranch,
    LabGroup, LabReading, LabRollup, MedRollup, PhecodeBranch,
};
pub use store::{HistoryStore, MemoryStore, TaxonomyStore, VitalRecords};
pub use tabs::{Dashboard, Tab, TabRequest};
