//! Local embedding generation via fastembed (ONNX-based, no API key needed).

use super::Embedder;
use anyhow::Result;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use std::sync::Mutex;
use tracing::info;

pub struct LocalEmbedder {
    model: Mutex<TextEmbedding>,
    dimension: usize,
}

impl LocalEmbedder {
    /// Load the embedding model. Downloads it on first use (~30MB).
    pub fn new(model_name: &str) -> Result<Self> {
        let (model_type, dimension) = match model_name {
            "BAAI/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "BAAI/bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            _ => {
                anyhow::bail!(
                    "unsupported embedding model '{}'; use BAAI/bge-small-en-v1.5 or BAAI/bge-base-en-v1.5",
                    model_name
                );
            }
        };

        let model = TextEmbedding::try_new(
            TextInitOptions::new(model_type).with_show_download_progress(true),
        )?;
        info!("embedding model loaded: {} (dim={})", model_name, dimension);

        Ok(Self {
            model: Mutex::new(model),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut model = self.model.lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let embeddings = model.embed(vec![text.to_string()], None)?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty embedding result"))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
