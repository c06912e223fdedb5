use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_MODEL_ID: &str = "local-hash-trigram-v1";
pub const DEFAULT_MODEL_NAME: &str = "hashed word, bigram and trigram features";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const DEFAULT_BACKEND: &str = "local-hash-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
}

pub fn resolve_model_config(model_id: &str) -> SemanticModelConfig {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    let model_name = if resolved_id == DEFAULT_MODEL_ID {
        DEFAULT_MODEL_NAME
    } else {
        resolved_id
    };

    SemanticModelConfig {
        model_id: resolved_id.to_string(),
        model_name: model_name.to_string(),
        dimensions: DEFAULT_EMBEDDING_DIM,
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: DEFAULT_BACKEND.to_string(),
    }
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Text embedded for one indexed value; `None` for blank values.
pub fn value_payload_for_embedding(value: &str) -> Option<String> {
    let normalized = normalize_whitespace(value);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub fn embedding_text_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn embed_text_local(payload: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];
    let mut features = tokenize_payload(payload);

    if features.is_empty() {
        return vector;
    }

    for (feature, scale) in features.drain(..) {
        let hash = stable_hash(&feature);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight * scale;
    }

    normalize_vector(&mut vector);
    vector
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

/// Lower is closer; identical normalized vectors sit at 0.0.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> f64 {
    (1.0 - cosine_similarity(left, right)).max(0.0)
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    if out.len() == expected_dim {
        Some(out)
    } else {
        None
    }
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

// Word and bigram features carry exact-term signal; character trigrams let "grocery" reach
// "Groceries" and misspelled merchant names.
fn tokenize_payload(payload: &str) -> Vec<(String, f32)> {
    let normalized = normalize_whitespace(payload);
    if normalized.is_empty() {
        return Vec::new();
    }

    let words = normalized
        .split(' ')
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    if words.is_empty() {
        return Vec::new();
    }

    let mut features = Vec::<(String, f32)>::with_capacity(words.len() * 8);
    for (index, word) in words.iter().enumerate() {
        features.push((format!("w:{word}"), 1.0));
        if let Some(next) = words.get(index + 1) {
            features.push((format!("b:{word}_{next}"), 0.5));
        }

        let padded = format!("^{word}$");
        let chars = padded.chars().collect::<Vec<char>>();
        for window in chars.windows(3) {
            features.push((format!("c:{}", window.iter().collect::<String>()), 0.6));
        }
    }
    features
}

fn normalize_vector(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|value| f64::from(*value).powi(2))
        .sum::<f64>()
        .sqrt() as f32;

    if norm > 0.0 {
        values.iter_mut().for_each(|value| *value /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_payloads_have_zero_distance() {
        let left = embed_text_local("Supermarkets and Groceries", DEFAULT_EMBEDDING_DIM);
        let right = embed_text_local("supermarkets   and groceries", DEFAULT_EMBEDDING_DIM);
        assert!(cosine_distance(&left, &right) < 1e-6);
    }

    #[test]
    fn trigram_features_pull_inflected_terms_closer() {
        let query = embed_text_local("grocery", DEFAULT_EMBEDDING_DIM);
        let related = embed_text_local("Groceries", DEFAULT_EMBEDDING_DIM);
        let unrelated = embed_text_local("ATM Withdrawal", DEFAULT_EMBEDDING_DIM);
        assert!(cosine_distance(&query, &related) < cosine_distance(&query, &unrelated));
    }

    #[test]
    fn embedding_blob_round_trips_and_rejects_wrong_dimensions() {
        let vector = embed_text_local("coffee", 16);
        let blob = encode_embedding_blob(&vector);
        assert_eq!(decode_embedding_blob(&blob, 16), Some(vector));
        assert_eq!(decode_embedding_blob(&blob, 8), None);
    }

    #[test]
    fn blank_values_are_not_embedded() {
        assert!(value_payload_for_embedding("   ").is_none());
        assert_eq!(
            value_payload_for_embedding(" Gas  Stations ").as_deref(),
            Some("Gas Stations")
        );
    }
}
