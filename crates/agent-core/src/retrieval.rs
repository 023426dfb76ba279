//! Retrieval
//!
//! Vector store abstraction, an in-memory store, and the hook that prepends
//! nearest-neighbour context to a run before the first provider call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// A stored text and its vector
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Embedding {
    pub id: String,
    pub content: String,
    pub vector: Vec<f32>,
}

/// Nearest-neighbour query
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,

    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Results scoring below this are dropped
    #[serde(default)]
    pub min_score: f32,
}

fn default_limit() -> usize {
    3
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: default_limit(),
            min_score: 0.0,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

/// One ranked hit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub embedding: Embedding,
    pub score: f32,
}

/// Turns text into vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Storage and similarity search over embedded texts
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and store `texts`
    async fn add(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Ranked results, best first
    async fn search(&self, params: &SearchParams) -> Result<Vec<SearchResult>>;
}

/// Vector store kept in process memory, ranked by cosine similarity
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<Embedding>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let vectors = self.embedder.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(AgentError::VectorStore(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        let added: Vec<Embedding> = texts
            .iter()
            .zip(vectors)
            .map(|(content, vector)| Embedding {
                id: uuid::Uuid::new_v4().to_string(),
                content: content.clone(),
                vector,
            })
            .collect();

        self.entries.write().await.extend(added.iter().cloned());
        tracing::debug!(count = added.len(), "Added embeddings to in-memory store");
        Ok(added)
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<SearchResult>> {
        let query = self
            .embedder
            .embed(std::slice::from_ref(&params.query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::VectorStore("embedder returned no vector for query".into()))?;

        let entries = self.entries.read().await;
        let mut results: Vec<SearchResult> = entries
            .iter()
            .map(|e| SearchResult {
                score: cosine_similarity(&query, &e.vector),
                embedding: e.clone(),
            })
            .filter(|r| r.score >= params.min_score)
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(params.limit);
        Ok(results)
    }
}

/// Cosine similarity; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Prepends retrieved context to a run
#[derive(Clone)]
pub struct RetrievalHook {
    store: Arc<dyn VectorStore>,
    limit: usize,
    min_score: f32,
    role: Role,
}

impl RetrievalHook {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            limit: default_limit(),
            min_score: 0.0,
            role: Role::System,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Role of the context message (system or user)
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Context messages for `input`; empty when nothing relevant was found
    /// or the store failed.
    pub async fn context_messages(&self, input: &str) -> Vec<Message> {
        let params = SearchParams::new(input).limit(self.limit).min_score(self.min_score);

        let results = match self.store.search(&params).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Retrieval failed, continuing without context: {e}");
                return Vec::new();
            }
        };

        if results.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = results.len(), "Retrieved context for run");

        let mut context = String::from("Relevant context retrieved for this request:\n");
        for (i, result) in results.iter().enumerate() {
            context.push_str(&format!(
                "[{}] (score {:.2}) {}\n",
                i + 1,
                result.score,
                result.embedding.content
            ));
        }

        vec![Message::new(self.role, context.trim_end())]
    }
}
