//! Semantic Minister Selector ("Cabinet").
//!
//! Each Minister's role text is embedded once at formation. `convene` embeds the
//! issue and picks the Minister with the highest cosine similarity; callers decide how
//! to react to a low score. Vectors carry the embedder version they were produced with
//! and are never compared across versions.

use crate::error::CabinetError;
use crate::registry::{BackendRegistry, Profile};
use crate::traits::Embedder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_DELEGATION_THRESHOLD: f32 = 0.6;
pub const DEFAULT_EMBEDDING_CACHE_CAPACITY: usize = 1_024;

/// `[cabinet]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CabinetSettings {
    /// Below this, the executor hands the issue to the President.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f32,
    /// Issue-embedding cache size; 0 disables caching.
    #[serde(default = "default_cache_capacity")]
    pub embedding_cache_capacity: usize,
}

fn default_threshold() -> f32 {
    DEFAULT_DELEGATION_THRESHOLD
}

fn default_cache_capacity() -> usize {
    DEFAULT_EMBEDDING_CACHE_CAPACITY
}

impl Default for CabinetSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_DELEGATION_THRESHOLD,
            embedding_cache_capacity: DEFAULT_EMBEDDING_CACHE_CAPACITY,
        }
    }
}

/// A unit vector tagged with the embedder version that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEmbedding {
    pub version: String,
    pub vector: Arc<[f32]>,
}

impl TaggedEmbedding {
    /// L2-normalizes `raw`. A zero vector stays zero (similarity 0 with everything).
    pub fn new(version: impl Into<String>, mut raw: Vec<f32>) -> Self {
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 && norm.is_finite() {
            for x in &mut raw {
                *x /= norm;
            }
        }
        Self {
            version: version.into(),
            vector: raw.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Cosine similarity (dot product of unit vectors), in [-1, 1].
    pub fn similarity(&self, other: &TaggedEmbedding) -> Result<f32, CabinetError> {
        if self.version != other.version {
            return Err(CabinetError::EmbedderVersionMismatch {
                formed: self.version.clone(),
                query: other.version.clone(),
            });
        }
        if self.dimension() != other.dimension() {
            return Err(CabinetError::DimensionMismatch {
                expected: self.dimension(),
                actual: other.dimension(),
            });
        }
        let dot: f32 = self.vector.iter().zip(other.vector.iter()).map(|(a, b)| a * b).sum();
        Ok(dot.clamp(-1.0, 1.0))
    }
}

struct Minister {
    profile: Arc<Profile>,
    embedding: TaggedEmbedding,
}

/// The fixed government: Ministers, the President, and the routing threshold.
/// Read-only after [`Cabinet::form`]; share it behind an `Arc`.
pub struct Cabinet {
    ministers: Vec<Minister>,
    president: Arc<Profile>,
    settings: CabinetSettings,
    embedder: Arc<dyn Embedder>,
    formed_version: String,
    dimension: usize,
    cache: DashMap<String, TaggedEmbedding>,
}

impl Cabinet {
    /// Embed every Minister's role text. The President is not a routing candidate.
    pub async fn form(
        registry: &BackendRegistry,
        embedder: Arc<dyn Embedder>,
        settings: CabinetSettings,
    ) -> Result<Self, CabinetError> {
        let formed_version = embedder.version();
        let dimension = embedder.dimension();
        let mut ministers = Vec::new();
        for profile in registry.ministers() {
            let raw = embedder
                .embed(&profile.embedding_text())
                .await
                .map_err(|e| CabinetError::Embedding(e.to_string()))?;
            if raw.len() != dimension {
                return Err(CabinetError::DimensionMismatch {
                    expected: dimension,
                    actual: raw.len(),
                });
            }
            ministers.push(Minister {
                profile: Arc::clone(profile),
                embedding: TaggedEmbedding::new(formed_version.clone(), raw),
            });
        }
        info!(
            target: "capsule::cabinet",
            ministers = ministers.len(),
            embedder = %formed_version,
            threshold = settings.confidence_threshold,
            "Cabinet formed"
        );
        Ok(Self {
            ministers,
            president: registry.default_profile(),
            settings,
            embedder,
            formed_version,
            dimension,
            cache: DashMap::new(),
        })
    }

    pub fn president(&self) -> Arc<Profile> {
        Arc::clone(&self.president)
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.settings.confidence_threshold
    }

    pub fn embedder_version(&self) -> &str {
        &self.formed_version
    }

    pub fn minister_titles(&self) -> Vec<String> {
        self.ministers.iter().map(|m| m.profile.title.clone()).collect()
    }

    /// Choose the Minister for `issue`. Empty issues go to the President with
    /// confidence 1.0. Ties go to the first-registered Minister.
    pub async fn convene(&self, issue: &str) -> Result<(Arc<Profile>, f32), CabinetError> {
        let issue = issue.trim();
        if issue.is_empty() {
            return Ok((self.president(), 1.0));
        }
        if self.ministers.is_empty() {
            return Err(CabinetError::Empty);
        }

        let query = self.issue_embedding(issue).await?;
        let mut best: Option<(&Minister, f32)> = None;
        for minister in &self.ministers {
            let score = minister.embedding.similarity(&query)?;
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((minister, score)),
            }
        }
        let (minister, score) = best.ok_or(CabinetError::Empty)?;
        debug!(
            target: "capsule::cabinet",
            minister = %minister.profile.title,
            confidence = score,
            issue_len = issue.len(),
            "Cabinet convened"
        );
        Ok((Arc::clone(&minister.profile), score))
    }

    async fn issue_embedding(&self, issue: &str) -> Result<TaggedEmbedding, CabinetError> {
        let current = self.embedder.version();
        if current != self.formed_version {
            warn!(
                target: "capsule::cabinet",
                formed = %self.formed_version,
                current = %current,
                "Embedder version changed since cabinet formation; refusing to mix vectors"
            );
            return Err(CabinetError::EmbedderVersionMismatch {
                formed: self.formed_version.clone(),
                query: current,
            });
        }
        if let Some(hit) = self.cache.get(issue) {
            return Ok(hit.value().clone());
        }
        let raw = self
            .embedder
            .embed(issue)
            .await
            .map_err(|e| CabinetError::Embedding(e.to_string()))?;
        if raw.len() != self.dimension {
            return Err(CabinetError::DimensionMismatch {
                expected: self.dimension,
                actual: raw.len(),
            });
        }
        let tagged = TaggedEmbedding::new(current, raw);
        let capacity = self.settings.embedding_cache_capacity;
        if capacity > 0 {
            if self.cache.len() >= capacity {
                self.cache.clear();
            }
            self.cache.insert(issue.to_string(), tagged.clone());
        }
        Ok(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::registry::MetabolicCost;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Axis embedder: each keyword maps to one dimension.
    struct KeywordEmbedder {
        version: Mutex<String>,
        calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        const AXES: [&'static str; 4] = ["strategy", "truth", "code", "poem"];

        fn new() -> Self {
            Self { version: Mutex::new("kw-1".to_string()), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl Embedder for KeywordEmbedder {
        fn version(&self) -> String {
            self.version.lock().unwrap().clone()
        }

        fn dimension(&self) -> usize {
            Self::AXES.len()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let lower = text.to_lowercase();
            Ok(Self::AXES.iter().map(|k| if lower.contains(k) { 1.0 } else { 0.0 }).collect())
        }
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            Profile::new("President", "base", MetabolicCost::Low).as_president(),
            Profile::new("Chief Strategist", "big", MetabolicCost::High).with_capabilities(["strategy"]),
            Profile::new("Fact Checker", "small", MetabolicCost::Low).with_capabilities(["truth"]),
            Profile::new("Second Strategist", "big2", MetabolicCost::High).with_capabilities(["strategy"]),
        ])
        .unwrap()
    }

    async fn cabinet(embedder: Arc<KeywordEmbedder>) -> Cabinet {
        Cabinet::form(&registry(), embedder, CabinetSettings::default()).await.unwrap()
    }

    #[tokio::test]
    async fn ministers_keep_registry_order_without_the_president() {
        let cab = cabinet(Arc::new(KeywordEmbedder::new())).await;
        assert_eq!(
            cab.minister_titles(),
            vec!["Chief Strategist", "Fact Checker", "Second Strategist"]
        );
    }

    #[tokio::test]
    async fn empty_issue_goes_to_president() {
        let cab = cabinet(Arc::new(KeywordEmbedder::new())).await;
        let (p, c) = cab.convene("   ").await.unwrap();
        assert_eq!(p.title, "President");
        assert_eq!(c, 1.0);
    }

    #[tokio::test]
    async fn picks_best_match_and_first_registered_on_tie() {
        let cab = cabinet(Arc::new(KeywordEmbedder::new())).await;
        let (p, c) = cab.convene("is this truth?").await.unwrap();
        assert_eq!(p.title, "Fact Checker");
        assert!((c - 1.0).abs() < 1e-6);

        let (p, _) = cab.convene("plan a strategy").await.unwrap();
        assert_eq!(p.title, "Chief Strategist");
    }

    #[tokio::test]
    async fn unmatched_issue_returns_low_confidence() {
        let cab = cabinet(Arc::new(KeywordEmbedder::new())).await;
        let (p, c) = cab.convene("write a poem").await.unwrap();
        assert_eq!(p.title, "Chief Strategist");
        assert_eq!(c, 0.0);
        assert!(c < cab.confidence_threshold());
    }

    #[tokio::test]
    async fn issue_embeddings_are_cached() {
        let emb = Arc::new(KeywordEmbedder::new());
        let cab = cabinet(Arc::clone(&emb)).await;
        let after_form = emb.calls.load(Ordering::SeqCst);
        cab.convene("truth check").await.unwrap();
        cab.convene("truth check").await.unwrap();
        assert_eq!(emb.calls.load(Ordering::SeqCst), after_form + 1);
    }

    #[tokio::test]
    async fn refuses_to_mix_embedder_versions() {
        let emb = Arc::new(KeywordEmbedder::new());
        let cab = cabinet(Arc::clone(&emb)).await;
        *emb.version.lock().unwrap() = "kw-2".to_string();
        let err = cab.convene("truth").await.unwrap_err();
        assert!(matches!(err, CabinetError::EmbedderVersionMismatch { .. }));
    }

    #[test]
    fn tagged_similarity_rejects_other_versions() {
        let a = TaggedEmbedding::new("v1", vec![3.0, 4.0]);
        let b = TaggedEmbedding::new("v2", vec![3.0, 4.0]);
        assert!((a.similarity(&a).unwrap() - 1.0).abs() < 1e-6);
        assert!(a.similarity(&b).is_err());
    }
}
