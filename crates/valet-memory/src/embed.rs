//! Deterministic text embedder.
//!
//! Hashed character-gram vectors, not learned embeddings. The vector score
//! is always blended with the FTS rank during recall, so lexical-adjacent
//! quality is sufficient here and the embedder stays dependency-free and
//! reproducible across runs.

/// Which hashing scheme produced a stored vector. The model id is persisted
/// alongside every embedding so a scheme change can migrate lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedModel {
    /// Trigrams over `#text#` plus weighted whole-token buckets, 384 dims.
    GramV1,
    /// Hashed whole tokens only, 256 dims.
    TokenV1,
}

impl EmbedModel {
    pub fn from_id(id: &str) -> Self {
        match id {
            "token-v1-256" => Self::TokenV1,
            _ => Self::GramV1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Embedder {
    model: EmbedModel,
}

impl Embedder {
    pub fn new(model: EmbedModel) -> Self {
        Self { model }
    }

    /// Opaque identifier persisted with each stored vector.
    pub fn model_id(&self) -> &'static str {
        match self.model {
            EmbedModel::GramV1 => "gram-v1-384",
            EmbedModel::TokenV1 => "token-v1-256",
        }
    }

    pub fn dim(&self) -> usize {
        match self.model {
            EmbedModel::GramV1 => 384,
            EmbedModel::TokenV1 => 256,
        }
    }

    /// Embed text into a unit-length vector. Empty or all-separator input
    /// yields the zero vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let normalized = text.trim().to_lowercase();
        let mut vector = vec![0f32; self.dim()];
        if normalized.is_empty() {
            return vector;
        }

        match self.model {
            EmbedModel::GramV1 => {
                let padded: Vec<char> = format!("#{normalized}#").chars().collect();
                for window in padded.windows(3) {
                    let gram: String = window.iter().collect();
                    let bucket = (fnv1a64(gram.as_bytes()) % self.dim() as u64) as usize;
                    vector[bucket] += 1.0;
                }
                for token in tokenize(&normalized) {
                    let bucket = (fnv1a64(token.as_bytes()) % self.dim() as u64) as usize;
                    vector[bucket] += 1.5;
                }
            }
            EmbedModel::TokenV1 => {
                for token in tokenize(&normalized) {
                    let bucket = (fnv1a64(token.as_bytes()) % self.dim() as u64) as usize;
                    vector[bucket] += 1.0;
                }
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

/// Cosine similarity. Zero vectors score 0 rather than NaN.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Lowercase alphanumeric segments, minimum two chars.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(String::from)
        .collect()
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_unit_length() {
        let embedder = Embedder::new(EmbedModel::GramV1);
        let a = embedder.embed("I prefer dark roast coffee");
        let b = embedder.embed("I prefer dark roast coffee");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        let embedder = Embedder::new(EmbedModel::GramV1);
        assert_eq!(embedder.embed("  Dark Roast "), embedder.embed("dark roast"));
    }

    #[test]
    fn related_text_scores_above_unrelated() {
        let embedder = Embedder::new(EmbedModel::GramV1);
        let query = embedder.embed("what coffee do I like");
        let related = embedder.embed("prefers dark roast coffee");
        let unrelated = embedder.embed("the train leaves at nine");
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn token_variant_has_smaller_dim() {
        let embedder = Embedder::new(EmbedModel::from_id("token-v1-256"));
        assert_eq!(embedder.model_id(), "token-v1-256");
        assert_eq!(embedder.embed("hello world").len(), 256);
    }

    #[test]
    fn empty_input_is_zero_vector() {
        let embedder = Embedder::new(EmbedModel::GramV1);
        let v = embedder.embed("   ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&v, &v), 0.0);
    }
}
