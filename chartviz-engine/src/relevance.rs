//! Expands a set of ICD codes into semantically related codes via the embedding index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chartviz_core::{icd_parent, ChartError, EngineConfig, EventKind};

use crate::embedding::{EmbeddingIndex, Neighbor, VocabToken};
use crate::store::TaxonomyStore;

/// Related codes bucketed by kind, with the best score seen per bare code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
    pub codes: BTreeMap<EventKind, BTreeSet<String>>,
    pub scores: HashMap<String, f64>,
}

impl Expansion {
    pub fn codes_of(&self, kind: EventKind) -> BTreeSet<String> {
        self.codes.get(&kind).cloned().unwrap_or_default()
    }

    pub fn score(&self, code: &str) -> f64 {
        self.scores.get(code).copied().unwrap_or(0.0)
    }
}

/// Bounded LRU of neighbor lists keyed by ICD code.
#[cfg(not(target_arch = "wasm32"))]
struct NeighborCache(moka::sync::Cache<String, Arc<Vec<Neighbor>>>);

#[cfg(not(target_arch = "wasm32"))]
impl NeighborCache {
    fn new(capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(moka::policy::EvictionPolicy::lru())
            .build();
        Self(cache)
    }

    fn get(&self, code: &str) -> Option<Arc<Vec<Neighbor>>> {
        self.0.get(code)
    }

    fn insert(&self, code: String, neighbors: Arc<Vec<Neighbor>>) {
        self.0.insert(code, neighbors);
    }

    #[cfg(test)]
    fn entry_count(&self) -> u64 {
        self.0.run_pending_tasks();
        self.0.entry_count()
    }
}

/// moka's clock reads `Instant::now`, which panics on wasm32, so the browser build keeps a
/// mutex-guarded LRU instead.
#[cfg(target_arch = "wasm32")]
struct NeighborCache(std::sync::Mutex<lru::LruCache<String, Arc<Vec<Neighbor>>>>);

#[cfg(target_arch = "wasm32")]
impl NeighborCache {
    fn new(capacity: u64) -> Self {
        let capacity = usize::try_from(capacity)
            .ok()
            .and_then(std::num::NonZeroUsize::new)
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self(std::sync::Mutex::new(lru::LruCache::new(capacity)))
    }

    fn get(&self, code: &str) -> Option<Arc<Vec<Neighbor>>> {
        let mut cache = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.get(code).cloned()
    }

    fn insert(&self, code: String, neighbors: Arc<Vec<Neighbor>>) {
        let mut cache = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(code, neighbors);
    }
}

pub struct RelevanceExpander {
    index: Arc<dyn EmbeddingIndex>,
    taxonomy: Arc<dyn TaxonomyStore>,
    neighbor_count: usize,
    always_include_labs: BTreeSet<String>,
    cache: NeighborCache,
}

impl RelevanceExpander {
    pub fn new(
        index: Arc<dyn EmbeddingIndex>,
        taxonomy: Arc<dyn TaxonomyStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            index,
            taxonomy,
            neighbor_count: config.neighbor_count,
            always_include_labs: config.always_include_labs.clone(),
            cache: NeighborCache::new(config.relevance_cache_capacity),
        }
    }

    /// Neighbors of an ICD code, descending by score. Cached per code.
    pub fn similar(&self, code: &str) -> Result<Arc<Vec<Neighbor>>, ChartError> {
        if let Some(hit) = self.cache.get(code) {
            tracing::debug!(code, "Neighbor cache hit");
            return Ok(hit);
        }
        tracing::debug!(code, "Neighbor cache miss");
        let neighbors = Arc::new(self.lookup(code)?);
        self.cache.insert(code.to_string(), Arc::clone(&neighbors));
        Ok(neighbors)
    }

    fn lookup(&self, code: &str) -> Result<Vec<Neighbor>, ChartError> {
        let token = VocabToken::icd(code).to_string();
        if let Some(hits) = self.index.similar_by_token(&token, self.neighbor_count)? {
            return Ok(hits);
        }

        // Out of vocabulary: retry once with the best-ranked sibling under the same parent.
        let parent = icd_parent(code);
        let siblings = self.taxonomy.ranked_icds_with_parent(parent)?;
        let Some(sibling) = siblings.first() else {
            tracing::debug!(code, parent, "No ranked sibling for out-of-vocabulary code");
            return Ok(Vec::new());
        };
        let retry = VocabToken::icd(&sibling.code).to_string();
        let hits = self
            .index
            .similar_by_token(&retry, self.neighbor_count)?
            .unwrap_or_default();
        tracing::debug!(
            code,
            substitute = %sibling.code,
            hits = hits.len(),
            "Out-of-vocabulary code resolved through sibling"
        );
        Ok(hits)
    }

    /// Walk each source code's neighbors until the first score below `threshold`.
    pub fn expand<'a, I>(&self, source_codes: I, threshold: f64) -> Result<Expansion, ChartError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut expansion = Expansion::default();
        for source in source_codes {
            let neighbors = self.similar(source)?;
            for neighbor in neighbors.iter() {
                if neighbor.score < threshold {
                    break;
                }
                let token: VocabToken = neighbor.token.parse()?;
                expansion
                    .codes
                    .entry(token.kind)
                    .or_default()
                    .insert(token.code.clone());
                let best = expansion.scores.entry(token.code).or_insert(neighbor.score);
                *best = best.max(neighbor.score);
            }
        }

        let labs = expansion.codes.entry(EventKind::Lab).or_default();
        for code in &self.always_include_labs {
            labs.insert(code.clone());
            expansion.scores.entry(code.clone()).or_insert(0.0);
        }

        tracing::debug!(
            labs = expansion.codes_of(EventKind::Lab).len(),
            meds = expansion.codes_of(EventKind::Med).len(),
            icds = expansion.codes_of(EventKind::Icd).len(),
            "Expanded related codes"
        );
        Ok(expansion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NeighborTable;
    use crate::store::MemoryStore;
    use chartviz_core::{IcdCode, TaxonomyCatalog};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIndex {
        inner: NeighborTable,
        calls: AtomicUsize,
    }

    impl EmbeddingIndex for CountingIndex {
        fn similar_by_token(
            &self,
            token: &str,
            top_n: usize,
        ) -> Result<Option<Vec<Neighbor>>, ChartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.similar_by_token(token, top_n)
        }
    }

    fn table() -> NeighborTable {
        NeighborTable::from_json(
            r#"{
                "ICD: 250.00": [["LAB: Na", 0.9], ["MED: metformin", 0.5], ["ICD: 401.0", 0.1]],
                "ICD: 250.02": [["MED: insulin", 0.8], ["LAB: Na", 0.95]],
                "ICD: 401.0": [["MED: lisinopril", 0.7], ["ICD: 401.9", 0.6]]
            }"#,
        )
        .unwrap()
    }

    fn taxonomy() -> Arc<MemoryStore> {
        let icd = |code: &str, rank: Option<i64>| IcdCode {
            code: code.into(),
            description: code.into(),
            phecode: None,
            chapter: None,
            rank,
        };
        let catalog = TaxonomyCatalog {
            icds: vec![
                icd("250.00", Some(2)),
                icd("250.02", Some(1)),
                icd("250.09", None),
                icd("404.1", Some(4)),
            ],
            ..TaxonomyCatalog::default()
        };
        Arc::new(MemoryStore::new(catalog, Vec::new()).unwrap())
    }

    fn expander(config: &EngineConfig) -> RelevanceExpander {
        RelevanceExpander::new(Arc::new(table()), taxonomy(), config)
    }

    #[test]
    fn expand_stops_at_threshold() {
        let expansion = expander(&EngineConfig::default())
            .expand(["250.00"], 0.2)
            .unwrap();
        assert!(expansion.codes_of(EventKind::Lab).contains("Na"));
        assert!(expansion.codes_of(EventKind::Med).contains("metformin"));
        assert!(!expansion.codes_of(EventKind::Icd).contains("401.0"));
        assert_eq!(expansion.scores["Na"], 0.9);
        assert_eq!(expansion.scores["metformin"], 0.5);
        assert!(!expansion.scores.contains_key("401.0"));
    }

    #[test]
    fn max_score_wins_across_sources() {
        let expansion = expander(&EngineConfig::default())
            .expand(["250.00", "250.02"], 0.2)
            .unwrap();
        assert_eq!(expansion.scores["Na"], 0.95);
        assert!(expansion.codes_of(EventKind::Med).contains("insulin"));
    }

    #[test]
    fn always_include_labs_default_to_zero() {
        let config = EngineConfig {
            always_include_labs: ["K".to_string(), "Na".to_string()].into_iter().collect(),
            ..EngineConfig::default()
        };
        let expansion = expander(&config).expand(["250.00"], 0.2).unwrap();
        assert!(expansion.codes_of(EventKind::Lab).contains("K"));
        assert_eq!(expansion.score("K"), 0.0);
        assert_eq!(expansion.score("Na"), 0.9);
    }

    #[test]
    fn out_of_vocabulary_falls_back_to_best_ranked_sibling() {
        let hits = expander(&EngineConfig::default()).similar("250.09").unwrap();
        assert_eq!(hits[0].token, "MED: insulin");
        assert_eq!(hits[1].token, "LAB: Na");
    }

    #[test]
    fn total_miss_is_empty() {
        let expander = expander(&EngineConfig::default());
        assert!(expander.similar("404.1").unwrap().is_empty());
        assert!(expander.similar("999.1").unwrap().is_empty());
        let expansion = expander.expand(["999.1"], 0.2).unwrap();
        assert!(expansion.codes_of(EventKind::Med).is_empty());
    }

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let index = Arc::new(CountingIndex {
            inner: table(),
            calls: AtomicUsize::new(0),
        });
        let expander = RelevanceExpander::new(
            Arc::clone(&index) as Arc<dyn EmbeddingIndex>,
            taxonomy(),
            &EngineConfig::default(),
        );
        expander.similar("250.00").unwrap();
        expander.similar("250.00").unwrap();
        expander.expand(["250.00"], 0.75).unwrap();
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_stays_within_capacity() {
        let index = Arc::new(CountingIndex {
            inner: table(),
            calls: AtomicUsize::new(0),
        });
        let config = EngineConfig {
            relevance_cache_capacity: 2,
            ..EngineConfig::default()
        };
        let expander = RelevanceExpander::new(
            Arc::clone(&index) as Arc<dyn EmbeddingIndex>,
            taxonomy(),
            &config,
        );
        for code in ["250.00", "250.02", "401.0", "404.1", "999.1"] {
            expander.similar(code).unwrap();
        }
        assert!(expander.cache.entry_count() <= 2);
        assert!(index.calls.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn concurrent_lookups_agree() {
        let expander = expander(&EngineConfig::default());
        let expected = expander.similar("250.00").unwrap();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let hits = expander.similar("250.00").unwrap();
                        let expansion = expander.expand(["250.00", "250.02"], 0.2).unwrap();
                        (hits, expansion.score("Na"))
                    })
                })
                .collect();
            for handle in handles {
                let (hits, na) = handle.join().unwrap();
                assert_eq!(hits, expected);
                assert_eq!(na, 0.95);
            }
        });
    }

    #[test]
    fn neighbor_count_caps_results() {
        let config = EngineConfig {
            neighbor_count: 1,
            ..EngineConfig::default()
        };
        let hits = expander(&config).similar("250.00").unwrap();
        assert_eq!(hits.len(), 1);
    }
}
