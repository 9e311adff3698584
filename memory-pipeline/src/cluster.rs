use common::utils::embedding::cosine_similarity;

/// Cluster id used for noise / unassignable outputs.
pub const NOISE_CLUSTER: i64 = -1;

#[allow(clippy::missing_docs_in_private_items)]
struct Centroid {
    id: i64,
    vector: Vec<f32>,
    count: usize,
}

/// Streaming nearest-centroid assigner.
///
/// Process-local and intentionally simple: an output joins the closest
/// centroid when the cosine similarity clears tau, otherwise it seeds a new
/// cluster. Centroids track the running mean of their members.
pub struct ClusterEngine {
    centroids: Vec<Centroid>,
    tau: f32,
    next_id: i64,
}

impl ClusterEngine {
    pub fn new(tau: f32) -> Self {
        Self {
            centroids: Vec::new(),
            tau,
            next_id: 0,
        }
    }

    /// Assign an embedding to a cluster. Returns `(cluster_id, confidence)`
    /// where confidence is the similarity to the centroid the output joined.
    pub fn assign(&mut self, embedding: &[f32]) -> (i64, f32) {
        if embedding.is_empty() {
            return (NOISE_CLUSTER, 0.0);
        }

        let best = self
            .centroids
            .iter_mut()
            .map(|centroid| {
                let similarity = cosine_similarity(&centroid.vector, embedding);
                (centroid, similarity)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((centroid, similarity)) = best {
            if similarity >= self.tau {
                let count = centroid.count as f32;
                for (slot, value) in centroid.vector.iter_mut().zip(embedding) {
                    *slot = (*slot * count + value) / (count + 1.0);
                }
                centroid.count += 1;
                return (centroid.id, similarity.clamp(0.0, 1.0));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.centroids.push(Centroid {
            id,
            vector: embedding.to_vec(),
            count: 1,
        });
        (id, 1.0)
    }

    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }
}
