use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use mnemo_core::types::IntentCategory;
use mnemo_llm::embed::cosine_similarity;
use mnemo_llm::Embedder;

use crate::entities::{self, ExtractedEntities};
use crate::error::Result;

/// Labeled examples per category. Small on purpose: the centroids only need
/// to separate a dozen coarse intents.
const EXAMPLES: &[(IntentCategory, &[&str])] = &[
    (
        IntentCategory::Greeting,
        &["hello there", "hi bot", "good morning", "hey, how's it going"],
    ),
    (
        IntentCategory::Farewell,
        &["goodbye", "see you later", "bye for now", "good night"],
    ),
    (
        IntentCategory::Thanks,
        &["thank you so much", "thanks, that helped", "much appreciated"],
    ),
    (
        IntentCategory::Help,
        &[
            "what can you do",
            "help me use this bot",
            "how do I talk to you",
            "show me the commands",
        ],
    ),
    (
        IntentCategory::Status,
        &["are you online", "status report", "how are your systems"],
    ),
    (
        IntentCategory::KnowledgeQuery,
        &[
            "explain how async runtimes work",
            "what is a vector database",
            "tell me about the history of Unix",
        ],
    ),
    (
        IntentCategory::MemoryStore,
        &[
            "remember that my timezone is UTC",
            "remember my favorite editor is helix",
            "please save that I work night shifts",
        ],
    ),
    (
        IntentCategory::MemoryRetrieve,
        &[
            "what's my timezone",
            "what did I tell you about my schedule",
            "do you remember my favorite editor",
        ],
    ),
    (
        IntentCategory::GraphQuery,
        &[
            "how is Go related to Discord",
            "what connects these two topics",
            "show me the path between Rust and Tokio",
        ],
    ),
    (
        IntentCategory::Chitchat,
        &[
            "how was your day",
            "tell me a joke",
            "what do you think about rainy weather",
        ],
    ),
    (
        IntentCategory::OutOfScope,
        &[
            "order me a pizza",
            "transfer money to my account",
            "call my mother",
        ],
    ),
];

/// Result of a single classification.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: IntentCategory,
    pub confidence: f32,
    pub entities: ExtractedEntities,
}

/// Zero-shot classifier: one centroid embedding per category, computed once
/// at first use, plus a regex pass for light entities.
pub struct IntentClassifier {
    embedder: Arc<Embedder>,
    threshold: f32,
    centroids: OnceCell<Vec<(IntentCategory, Vec<f32>)>>,
}

impl IntentClassifier {
    pub fn new(embedder: Arc<Embedder>, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
            centroids: OnceCell::new(),
        }
    }

    /// Whether the centroid table has been built yet (health reporting).
    pub fn is_loaded(&self) -> bool {
        self.centroids.initialized()
    }

    /// Classify a message. Deterministic for a fixed model and example set.
    ///
    /// Empty input short-circuits to `unknown` without touching the
    /// embedding service. The first call after a restart may block while the
    /// centroids load; the load itself is single-shot under the OnceCell so
    /// concurrent callers share one computation.
    #[instrument(skip(self, text))]
    pub async fn classify(&self, text: &str) -> Result<Classification> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Classification {
                category: IntentCategory::Unknown,
                confidence: 0.0,
                entities: ExtractedEntities::default(),
            });
        }

        let entities = entities::extract(trimmed);

        let centroids = self
            .centroids
            .get_or_try_init(|| self.build_centroids())
            .await?;

        let query = self.embedder.embed(trimmed).await?;

        let mut best = (IntentCategory::Unknown, f32::MIN);
        for (category, centroid) in centroids {
            let sim = cosine_similarity(&query, centroid);
            if sim > best.1 {
                best = (*category, sim);
            }
        }

        // Negative similarity carries no signal for a closed label set.
        let confidence = best.1.clamp(0.0, 1.0);
        let category = if confidence < self.threshold {
            IntentCategory::Unknown
        } else {
            best.0
        };

        debug!(%category, confidence, "classified message");
        Ok(Classification {
            category,
            confidence,
            entities,
        })
    }

    async fn build_centroids(&self) -> Result<Vec<(IntentCategory, Vec<f32>)>> {
        let mut centroids = Vec::with_capacity(EXAMPLES.len());
        for (category, examples) in EXAMPLES {
            let mut sum = vec![0.0_f32; self.embedder.dim()];
            for example in *examples {
                let v = self.embedder.embed(example).await?;
                for (acc, x) in sum.iter_mut().zip(&v) {
                    *acc += x;
                }
            }
            let n = examples.len() as f32;
            for acc in &mut sum {
                *acc /= n;
            }
            centroids.push((*category, sum));
        }
        debug!(categories = centroids.len(), "intent centroids built");
        Ok(centroids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_llm::{ChatRequest, ChatResponse, EmbeddingError, LlmClient, LlmError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic bag-of-words embedding over a tiny vocabulary, so that
    /// classification is reproducible and the test controls the geometry.
    struct VocabClient {
        embed_calls: AtomicUsize,
    }

    impl VocabClient {
        fn new() -> Self {
            Self {
                embed_calls: AtomicUsize::new(0),
            }
        }
    }

    const VOCAB: &[&str] = &[
        "hello", "hi", "morning", "goodbye", "bye", "thank", "thanks", "help", "commands",
        "status", "online", "explain", "what", "history", "remember", "save", "timezone",
        "favorite", "schedule", "related", "path", "connects", "joke", "weather", "pizza",
        "money", "call", "my", "is",
    ];

    #[async_trait]
    impl LlmClient for VocabClient {
        fn name(&self) -> &str {
            "vocab"
        }

        async fn chat(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, LlmError> {
            unimplemented!("not used")
        }

        async fn embed(
            &self,
            text: &str,
            _model: &str,
        ) -> std::result::Result<Vec<f32>, EmbeddingError> {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            let lower = text.to_lowercase();
            let mut v = vec![0.0_f32; VOCAB.len()];
            for (i, word) in VOCAB.iter().enumerate() {
                if lower.contains(word) {
                    v[i] = 1.0;
                }
            }
            if v.iter().all(|x| *x == 0.0) {
                v[0] = 0.01;
            }
            Ok(v)
        }
    }

    fn classifier(threshold: f32) -> (IntentClassifier, Arc<VocabClient>) {
        let client = Arc::new(VocabClient::new());
        let embedder = Arc::new(Embedder::new(
            client.clone(),
            "vocab",
            VOCAB.len(),
            1024,
            300,
        ));
        (IntentClassifier::new(embedder, threshold), client)
    }

    #[tokio::test]
    async fn empty_message_is_unknown_without_embedding() {
        let (clf, client) = classifier(0.5);
        let result = clf.classify("   ").await.expect("classify");
        assert_eq!(result.category, IntentCategory::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(client.embed_calls.load(Ordering::SeqCst), 0);
        assert!(!clf.is_loaded(), "no centroid load for empty input");
    }

    #[tokio::test]
    async fn memory_store_is_recognized_with_entities() {
        let (clf, _client) = classifier(0.3);
        let result = clf
            .classify("remember that my timezone is America/Sao_Paulo")
            .await
            .expect("classify");
        assert_eq!(result.category, IntentCategory::MemoryStore);
        assert_eq!(result.entities.memory_key.as_deref(), Some("timezone"));
        assert_eq!(
            result.entities.memory_value.as_deref(),
            Some("America/Sao_Paulo")
        );
    }

    #[tokio::test]
    async fn retrieval_question_maps_to_memory_retrieve() {
        let (clf, _client) = classifier(0.3);
        let result = clf.classify("what's my timezone?").await.expect("classify");
        assert_eq!(result.category, IntentCategory::MemoryRetrieve);
        assert_eq!(result.entities.memory_key.as_deref(), Some("timezone"));
    }

    #[tokio::test]
    async fn low_confidence_falls_back_to_unknown() {
        // A threshold of 1.0 can only be met by an exact centroid match.
        let (clf, _client) = classifier(1.0);
        let result = clf.classify("zzz qqq xyzzy").await.expect("classify");
        assert_eq!(result.category, IntentCategory::Unknown);
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let (clf, _client) = classifier(0.3);
        let a = clf.classify("hello there friend").await.expect("classify");
        let b = clf.classify("hello there friend").await.expect("classify");
        assert_eq!(a.category, b.category);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn centroids_load_once_across_concurrent_callers() {
        let (clf, client) = classifier(0.3);
        let clf = Arc::new(clf);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let clf = clf.clone();
            handles.push(tokio::spawn(async move {
                clf.classify("hello there").await.expect("classify")
            }));
        }
        for h in handles {
            h.await.expect("join");
        }

        // One embed call per example during the single centroid build, plus
        // one per classify (the embed cache dedupes the identical queries).
        let example_count: usize = EXAMPLES.iter().map(|(_, ex)| ex.len()).sum();
        assert_eq!(
            client.embed_calls.load(Ordering::SeqCst),
            example_count + 1,
            "centroids built exactly once"
        );
        assert!(clf.is_loaded());
    }
}
