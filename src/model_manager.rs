use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    settings::DEFAULT_EMBEDDING_MODEL,
};

pub const MODEL_ENV_VAR: &str = "LOCALDOCS_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn model_error(e: impl std::fmt::Display) -> Error {
    Error::Embedding(e.to_string())
}

/// Manages the ColBERT model lifecycle, supporting lazy loading on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    /// Creates a `ModelManager` for `model_id`, or for the model named by
    /// `LOCALDOCS_MODEL`, or for the default model, in that order.
    ///
    /// The model is not loaded until the first encode call.
    pub fn new(model_id: Option<String>) -> Self {
        let model_id = model_id
            .or_else(|| std::env::var(MODEL_ENV_VAR).ok())
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());

        Self {
            model: None,
            model_id,
        }
    }

    /// Returns the model ID that will be (or has been) loaded.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            tracing::info!(model = %self.model_id, "Loading embedding model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(model_error)?;
            self.model = Some(colbert);
        }

        self.model
            .as_mut()
            .ok_or_else(|| Error::Embedding("model not loaded".to_string()))
    }

    /// Encodes texts into one pooled, unit-length vector each.
    ///
    /// ColBERT yields a `[batch, tokens, dim]` tensor of token embeddings;
    /// averaging over the token axis gives a single vector per text.
    pub fn encode_pooled(
        &mut self,
        texts: &[String],
        is_query: bool,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.ensure_loaded()?;
        let tokens: Tensor =
            model.encode(texts, is_query).map_err(model_error)?;
        let pooled = tokens.mean(1).map_err(model_error)?;
        let mut vectors =
            pooled.to_vec2::<f32>().map_err(model_error)?;
        for vector in &mut vectors {
            normalize(vector);
        }
        Ok(vectors)
    }
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// [`Embedder`] backed by a lazily loaded ColBERT model.
pub struct ColbertEmbedder {
    model_id: String,
    model: Mutex<ModelManager>,
}

impl ColbertEmbedder {
    pub fn new(model_id: Option<String>) -> Self {
        let manager = ModelManager::new(model_id);
        Self {
            model_id: manager.model_id().to_string(),
            model: Mutex::new(manager),
        }
    }

    fn with_model<T>(
        &self,
        f: impl FnOnce(&mut ModelManager) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("model lock poisoned".into()))?;
        f(&mut guard)
    }
}

impl Embedder for ColbertEmbedder {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self
            .with_model(|m| m.encode_pooled(&[text.to_string()], true))?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("empty query embedding".into()))
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.with_model(|m| m.encode_pooled(texts, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::new(Some("custom/model".to_string()));
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn embedder_reports_model_without_loading() {
        let embedder = ColbertEmbedder::new(Some("custom/model".to_string()));
        assert_eq!(embedder.model_name(), "custom/model");
        assert!(!embedder.model.lock().unwrap().is_loaded());
    }

    #[test]
    fn empty_batch_does_not_load_model() {
        let mut manager = ModelManager::new(Some("custom/model".to_string()));
        assert!(manager.encode_pooled(&[], false).unwrap().is_empty());
        assert!(!manager.is_loaded());
    }

    #[test]
    fn normalize_scales_to_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
