//! Embedding index seam and vocabulary tokens of the form `"<KIND>: <code>"`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chartviz_core::{ChartError, EventKind};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One nearest-neighbor hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Neighbor {
    pub token: String,
    pub score: f64,
}

impl Neighbor {
    pub fn new(token: impl Into<String>, score: f64) -> Self {
        Self {
            token: token.into(),
            score,
        }
    }
}

/// Immutable nearest-neighbor lookup, loaded once at startup.
pub trait EmbeddingIndex: Send + Sync {
    /// Neighbors of `token`, descending by score, at most `top_n`.
    ///
    /// `Ok(None)` means the token is not in the vocabulary.
    fn similar_by_token(
        &self,
        token: &str,
        top_n: usize,
    ) -> Result<Option<Vec<Neighbor>>, ChartError>;
}

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ICD|LAB|MED):(.*)$").expect("constant pattern compiles"));

// Lab tokens may carry a signed bin ahead of the code, e.g. "LAB: -1 Na".
static LAB_BIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+\s+(\S.*)$").expect("constant pattern compiles"));

/// A parsed vocabulary token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VocabToken {
    pub kind: EventKind,
    pub code: String,
}

impl VocabToken {
    pub fn new(kind: EventKind, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
        }
    }

    pub fn icd(code: &str) -> Self {
        Self::new(EventKind::Icd, code)
    }
}

impl fmt::Display for VocabToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.code)
    }
}

impl FromStr for VocabToken {
    type Err = ChartError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let unknown = || ChartError::UnknownToken(token.to_string());
        let caps = TOKEN.captures(token).ok_or_else(unknown)?;
        let kind = match caps.get(1).map(|m| m.as_str()) {
            Some("ICD") => EventKind::Icd,
            Some("LAB") => EventKind::Lab,
            Some("MED") => EventKind::Med,
            _ => return Err(unknown()),
        };
        let rest = caps.get(2).map_or("", |m| m.as_str()).trim();
        let code = match kind {
            EventKind::Lab => LAB_BIN
                .captures(rest)
                .and_then(|bin| bin.get(1))
                .map_or(rest, |m| m.as_str()),
            _ => rest,
        };
        if code.is_empty() {
            return Err(unknown());
        }
        Ok(Self::new(kind, code))
    }
}

/// Split a vocabulary token into its kind and bare code.
pub fn disjoin(token: &str) -> Result<(EventKind, String), ChartError> {
    let parsed: VocabToken = token.parse()?;
    Ok((parsed.kind, parsed.code))
}

/// Precomputed neighbor lists per token.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    neighbors: HashMap<String, Vec<Neighbor>>,
}

impl NeighborTable {
    pub fn new(neighbors: HashMap<String, Vec<Neighbor>>) -> Self {
        let neighbors = neighbors
            .into_iter()
            .map(|(token, mut hits)| {
                sort_hits(&mut hits);
                (token, hits)
            })
            .collect();
        Self { neighbors }
    }

    /// JSON object mapping each token to `[[token, score], ...]`.
    pub fn from_json(json: &str) -> Result<Self, ChartError> {
        let raw: HashMap<String, Vec<(String, f64)>> =
            serde_json::from_str(json).map_err(|err| ChartError::Index(err.to_string()))?;
        let table = Self::new(
            raw.into_iter()
                .map(|(token, hits)| {
                    let hits = hits
                        .into_iter()
                        .map(|(t, score)| Neighbor::new(t, score))
                        .collect();
                    (token, hits)
                })
                .collect(),
        );
        tracing::info!(tokens = table.neighbors.len(), "Loaded neighbor table");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

impl EmbeddingIndex for NeighborTable {
    fn similar_by_token(
        &self,
        token: &str,
        top_n: usize,
    ) -> Result<Option<Vec<Neighbor>>, ChartError> {
        Ok(self
            .neighbors
            .get(token)
            .map(|hits| hits.iter().take(top_n).cloned().collect()))
    }
}

#[derive(Debug, Deserialize)]
struct VectorFile {
    vectors: HashMap<String, Vec<f32>>,
}

/// Token vectors searched by cosine similarity.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    tokens: Vec<String>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Result<Self, ChartError> {
        let mut entries: Vec<(String, Vec<f32>)> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let dimension = entries.first().map_or(0, |(_, v)| v.len());
        let mut index = Self::default();
        for (token, vector) in entries {
            if vector.len() != dimension || vector.is_empty() {
                return Err(ChartError::Index(format!(
                    "vector for {token} has dimension {}, expected {dimension}",
                    vector.len()
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(ChartError::Index(format!(
                    "vector for {token} contains non-finite values"
                )));
            }
            index.positions.insert(token.clone(), index.tokens.len());
            index.tokens.push(token);
            index.vectors.push(vector);
        }
        Ok(index)
    }

    /// JSON object `{"vectors": {"<token>": [f32, ...]}}`.
    pub fn from_json(json: &str) -> Result<Self, ChartError> {
        let file: VectorFile =
            serde_json::from_str(json).map_err(|err| ChartError::Index(err.to_string()))?;
        let index = Self::new(file.vectors)?;
        tracing::info!(tokens = index.tokens.len(), "Loaded embedding vectors");
        Ok(index)
    }
}

impl EmbeddingIndex for VectorIndex {
    fn similar_by_token(
        &self,
        token: &str,
        top_n: usize,
    ) -> Result<Option<Vec<Neighbor>>, ChartError> {
        let Some(&position) = self.positions.get(token) else {
            return Ok(None);
        };
        let query = &self.vectors[position];

        let mut hits: Vec<Neighbor> = self
            .tokens
            .iter()
            .zip(&self.vectors)
            .enumerate()
            .filter(|(idx, _)| *idx != position)
            .filter_map(|(_, (candidate, vector))| {
                cosine_similarity(query, vector).map(|score| Neighbor::new(candidate, score))
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_n);
        Ok(Some(hits))
    }
}

fn sort_hits(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.token.cmp(&b.token))
    });
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}
