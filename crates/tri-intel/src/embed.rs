// Embedding Capability
// Pluggable text-embedding backend; the engine degrades to empty similarity
// lists when none is available.

/// Text embedding backend.
///
/// `encode` returns `None` when the backend is unavailable; callers treat
/// that as "no similarity data", never as an error.
pub trait Embedder {
    fn encode(&self, texts: &[String]) -> Option<Vec<Vec<f32>>>;
    fn is_available(&self) -> bool;
    fn disabled_reason(&self) -> Option<&str> {
        None
    }
}

/// Always-unavailable backend used when no embedding feature is compiled in
/// or model init failed.
pub struct NullEmbedder {
    reason: String,
}

impl NullEmbedder {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Embedder for NullEmbedder {
    fn encode(&self, _texts: &[String]) -> Option<Vec<Vec<f32>>> {
        None
    }

    fn is_available(&self) -> bool {
        false
    }

    fn disabled_reason(&self) -> Option<&str> {
        Some(&self.reason)
    }
}

#[cfg(feature = "local-embeddings")]
pub mod fastembed_backend {
    use super::Embedder;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    pub const DEFAULT_MODEL: &str = "all-minilm-l6-v2";

    /// Local fastembed backend. Model init failures disable the service with
    /// a recorded reason instead of failing ingestion.
    pub struct FastembedEmbedder {
        model_name: String,
        model: Option<Mutex<TextEmbedding>>,
        disabled_reason: Option<String>,
    }

    impl FastembedEmbedder {
        pub fn new(model_name: Option<&str>) -> Self {
            let model_name = model_name.unwrap_or(DEFAULT_MODEL).to_string();
            let (model, disabled_reason) = match Self::parse_model_id(&model_name) {
                Some(parsed) => match TextEmbedding::try_new(InitOptions::new(parsed)) {
                    Ok(model) => (Some(Mutex::new(model)), None),
                    Err(err) => (
                        None,
                        Some(format!(
                            "failed to initialize embedding model '{model_name}': {err}"
                        )),
                    ),
                },
                None => (
                    None,
                    Some(format!(
                        "unsupported embedding model id '{model_name}'; supported: {DEFAULT_MODEL}"
                    )),
                ),
            };

            if let Some(reason) = &disabled_reason {
                tracing::warn!(model = %model_name, reason = %reason, "embeddings disabled");
            } else {
                tracing::info!(model = %model_name, "embeddings enabled");
            }

            Self {
                model_name,
                model,
                disabled_reason,
            }
        }

        fn parse_model_id(model_name: &str) -> Option<EmbeddingModel> {
            match model_name.trim().to_ascii_lowercase().as_str() {
                "all-minilm-l6-v2" | "all_minilm_l6_v2" => Some(EmbeddingModel::AllMiniLML6V2),
                _ => None,
            }
        }

        pub fn model_name(&self) -> &str {
            &self.model_name
        }
    }

    impl Embedder for FastembedEmbedder {
        fn encode(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return None;
            }
            let model = self.model.as_ref()?;
            let mut guard = model.lock().ok()?;
            let embeddings = guard.embed(texts.to_vec(), None).ok()?;
            // Normalize so inner product behaves as cosine similarity.
            Some(embeddings.into_iter().map(normalize).collect())
        }

        fn is_available(&self) -> bool {
            self.model.is_some()
        }

        fn disabled_reason(&self) -> Option<&str> {
            self.disabled_reason.as_deref()
        }
    }

    fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
        let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }
        vector
    }
}

/// Build the process-default embedder from the configured model name.
pub fn default_embedder(model_name: Option<&str>) -> Box<dyn Embedder> {
    #[cfg(feature = "local-embeddings")]
    {
        return Box::new(fastembed_backend::FastembedEmbedder::new(model_name));
    }
    #[cfg(not(feature = "local-embeddings"))]
    {
        let _ = model_name;
        Box::new(NullEmbedder::new(
            "built without the local-embeddings feature",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_embedder_is_unavailable() {
        let embedder = NullEmbedder::new("test");
        assert!(!embedder.is_available());
        assert!(embedder.encode(&["x".to_string()]).is_none());
        assert_eq!(embedder.disabled_reason(), Some("test"));
    }

    #[cfg(not(feature = "local-embeddings"))]
    #[test]
    fn default_embedder_degrades_without_feature() {
        let embedder = default_embedder(None);
        assert!(!embedder.is_available());
        assert!(embedder.disabled_reason().is_some());
    }
}
