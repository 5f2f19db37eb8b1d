use super::{check_vectors, EmbedderError, EmbeddingProvider, Result};
use crate::config::EmbeddingConfig;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Longest token sequence fed to the model; longer inputs are truncated.
const MAX_TOKENS: usize = 256;

/// A sentence-transformer (BERT family) run in-process with candle.
///
/// `embedding.model_dir` must contain `config.json`, `tokenizer.json` and
/// `model.safetensors`, as downloaded from the model hub. Output is the
/// attention-masked mean of the last hidden state, L2-normalised.
#[derive(Clone)]
pub struct LocalEmbedder {
    inner: Arc<LocalModel>,
    name: String,
    dimension: usize,
}

struct LocalModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl LocalEmbedder {
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let model_dir = config
            .model_dir
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| EmbedderError::ModelLoad("embedding.model_dir is required for the local provider".into()))?;
        let name = config.model.clone();

        tokio::task::spawn_blocking(move || Self::load_blocking(&model_dir, name))
            .await
            .map_err(|e| EmbedderError::ModelLoad(e.to_string()))?
    }

    fn load_blocking(model_dir: &Path, name: String) -> Result<Self> {
        let device = select_device();
        tracing::info!(dir = %model_dir.display(), ?device, "Loading local embedding model");

        let config_text = std::fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| EmbedderError::ModelLoad(format!("config.json: {}", e)))?;
        let bert_config: BertConfig =
            serde_json::from_str(&config_text).map_err(|e| EmbedderError::ModelLoad(format!("config.json: {}", e)))?;
        let dimension = hidden_size(&config_text)?;

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| EmbedderError::ModelLoad(format!("tokenizer.json: {}", e)))?;

        let weights = model_dir.join("model.safetensors");
        // SAFETY: the weights file is memory-mapped read-only and not modified while loaded.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device) }
            .map_err(|e| EmbedderError::ModelLoad(e.to_string()))?;
        let model = BertModel::load(vb, &bert_config).map_err(|e| EmbedderError::ModelLoad(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(LocalModel {
                model,
                tokenizer,
                device,
            }),
            name,
            dimension,
        })
    }
}

impl LocalModel {
    fn embed_one(&self, text: &str) -> candle_core::Result<Vec<f32>> {
        let (input_ids, attention_mask) = self.tokenize(text)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        masked_mean_l2(&hidden, &attention_mask)?.squeeze(0)?.to_vec1()
    }

    fn tokenize(&self, text: &str) -> candle_core::Result<(Tensor, Tensor)> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenization failed: {}", e)))?;

        let mut ids = encoding.get_ids().to_vec();
        let mut mask = encoding.get_attention_mask().to_vec();
        ids.truncate(MAX_TOKENS);
        mask.truncate(MAX_TOKENS);
        let len = ids.len();

        let input_ids = Tensor::from_vec(ids, (1, len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (1, len), &self.device)?;
        Ok((input_ids, attention_mask))
    }
}

/// Mean over real tokens of a `[B, T, H]` hidden state, then unit length.
fn masked_mean_l2(hidden: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?;
    let mean = summed.broadcast_div(&counts)?;

    let norm = mean.sqr()?.sum_keepdim(1)?.sqrt()?;
    let eps = Tensor::new(&[1e-12f32], hidden.device())?.to_dtype(hidden.dtype())?;
    mean.broadcast_div(&norm.broadcast_add(&eps)?)
}

fn hidden_size(config_text: &str) -> Result<usize> {
    let value: serde_json::Value =
        serde_json::from_str(config_text).map_err(|e| EmbedderError::ModelLoad(e.to_string()))?;
    value
        .get("hidden_size")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| EmbedderError::ModelLoad("config.json has no hidden_size".into()))
}

fn select_device() -> Device {
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    Device::Cpu
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inner = Arc::clone(&self.inner);
        let owned = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            owned
                .iter()
                .map(|text| inner.embed_one(text))
                .collect::<candle_core::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| EmbedderError::Inference(e.to_string()))?
        .map_err(|e| EmbedderError::Inference(e.to_string()))?;

        check_vectors(texts.len(), self.dimension, &vectors)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_size_from_config() {
        let config = r#"{"architectures":["BertModel"],"hidden_size":384,"num_attention_heads":12}"#;
        assert_eq!(hidden_size(config).unwrap(), 384);
        assert!(hidden_size(r#"{"vocab_size":30522}"#).is_err());
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let device = Device::Cpu;
        // One sequence, three tokens, hidden size two; the last token is padding.
        let hidden = Tensor::new(&[[[1f32, 0.0], [1.0, 0.0], [0.0, 9.0]]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let pooled: Vec<f32> = masked_mean_l2(&hidden, &mask).unwrap().squeeze(0).unwrap().to_vec1().unwrap();
        assert!((pooled[0] - 1.0).abs() < 1e-5);
        assert!(pooled[1].abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_load_requires_model_dir() {
        let config = EmbeddingConfig {
            provider: "local".to_string(),
            model_dir: None,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            LocalEmbedder::load(&config).await,
            Err(EmbedderError::ModelLoad(_))
        ));
    }
}
