use common::{scope::MemoryScope, storage::types::exchange::Exchange, utils::embedding::cosine_similarity};

/// The in-process arena that makes turn N's output searchable by turn N+1.
///
/// Three parallel vectors: raw outputs, their embeddings and the
/// materialized exchange rows. Everything cross-references by index, so a
/// batch publish is one append under one write guard and readers only ever
/// observe whole batches.
#[derive(Default)]
pub struct SessionBuffer {
    outputs: Vec<String>,
    embeddings: Vec<Option<Vec<f32>>>,
    nodes: Vec<Exchange>,
}

impl SessionBuffer {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append one published batch. The three slices stay index-aligned.
    pub fn append_batch(&mut self, batch: Vec<(String, Option<Vec<f32>>, Exchange)>) {
        self.outputs.reserve(batch.len());
        self.embeddings.reserve(batch.len());
        self.nodes.reserve(batch.len());
        for (output, embedding, node) in batch {
            self.outputs.push(output);
            self.embeddings.push(embedding);
            self.nodes.push(node);
        }
    }

    /// Cosine scan over the arena. Scope gates every hit; a session filter
    /// narrows to one conversation when given.
    pub fn search(
        &self,
        scope: &MemoryScope,
        session_id: Option<&str>,
        query_embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Vec<(Exchange, f32)> {
        if scope.is_empty() || query_embedding.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<(Exchange, f32)> = self
            .nodes
            .iter()
            .zip(&self.embeddings)
            .filter(|(node, _)| {
                scope.permits(node.user_id.as_deref(), node.tenant_id.as_deref())
            })
            .filter(|(node, _)| session_id.is_none_or(|sid| node.session_id == sid))
            .filter_map(|(node, embedding)| {
                let embedding = embedding.as_ref()?;
                let score = cosine_similarity(embedding, query_embedding);
                (score >= min_score).then(|| (node.clone(), score))
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }
}
