use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::ops::softmax;
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertModelConfig, DTYPE};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::engine::{BatchedClassifier, Classification};

const NUM_CLASSES: usize = 2;

/// BERT sequence classifier: encoder, `[CLS]` pooler, linear head, softmax.
pub struct BertBatchedClassifier {
    inner: Arc<BertInner>,
}

struct BertInner {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

#[derive(Debug, Clone)]
pub struct BertConfig {
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            model_path: Some(PathBuf::from("./model_save")),
            revision: "main".to_string(),
            use_pth: false,
            cpu: false,
            max_sequence_length: 128,
        }
    }
}

/// The slice of `config.json` the classifier head needs.
#[derive(Debug, Deserialize)]
struct HeadConfig {
    hidden_size: usize,
    #[serde(default)]
    num_labels: Option<usize>,
    #[serde(default)]
    id2label: Option<HashMap<String, String>>,
}

impl HeadConfig {
    fn num_labels(&self) -> usize {
        self.id2label
            .as_ref()
            .map(HashMap::len)
            .or(self.num_labels)
            .unwrap_or(NUM_CLASSES)
    }
}

#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    #[serde(default = "default_lowercase")]
    do_lower_case: bool,
}

fn default_lowercase() -> bool {
    true
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            do_lower_case: default_lowercase(),
        }
    }
}

#[derive(Debug)]
enum TokenizerSource {
    Json(PathBuf),
    Vocab {
        vocab: PathBuf,
        config: Option<PathBuf>,
    },
}

#[derive(Debug)]
struct ModelFiles {
    config: PathBuf,
    weights: PathBuf,
    tokenizer: TokenizerSource,
}

impl BertBatchedClassifier {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    #[tracing::instrument(skip(config), fields(model_path = ?config.model_path, model_id = ?config.model_id))]
    pub async fn new(config: BertConfig) -> Result<Self> {
        let files = match (&config.model_path, &config.model_id) {
            (Some(base_path), _) => Self::local_files(base_path, config.use_pth)?,
            (None, Some(model_id)) => {
                Self::hub_files(model_id, &config.revision, config.use_pth).await?
            }
            (None, None) => bail!("Either a model path or a model id must be specified"),
        };
        tracing::debug!(?files, "Resolved model files");

        let device = Self::device(config.cpu)?;

        let model_config = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let bert_config: BertModelConfig =
            serde_json::from_str(&model_config).context("Invalid BERT config.json")?;
        let head: HeadConfig =
            serde_json::from_str(&model_config).context("Invalid classifier head config")?;

        if head.num_labels() != NUM_CLASSES {
            bail!(
                "Expected a {NUM_CLASSES}-class classifier head, config declares {}",
                head.num_labels()
            );
        }

        let tokenizer = load_tokenizer(&files.tokenizer, config.max_sequence_length)?;

        let vb = if config.use_pth {
            VarBuilder::from_pth(&files.weights, DTYPE, &device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DTYPE, &device)? }
        };

        let inner = BertInner::load(vb, &bert_config, head.hidden_size, tokenizer, device)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn local_files(base_path: &Path, use_pth: bool) -> Result<ModelFiles> {
        if !base_path.is_dir() {
            bail!("Model path {} is not a directory.", base_path.display());
        }

        let weights = if use_pth {
            base_path.join("pytorch_model.bin")
        } else {
            base_path.join("model.safetensors")
        };
        let config = base_path.join("config.json");
        for required in [&config, &weights] {
            if !required.is_file() {
                bail!("Missing model artifact {}", required.display());
            }
        }

        let tokenizer_json = base_path.join("tokenizer.json");
        let tokenizer = if tokenizer_json.is_file() {
            TokenizerSource::Json(tokenizer_json)
        } else {
            let vocab = base_path.join("vocab.txt");
            if !vocab.is_file() {
                bail!(
                    "Model path {} has neither tokenizer.json nor vocab.txt",
                    base_path.display()
                );
            }
            let tokenizer_config = base_path.join("tokenizer_config.json");
            TokenizerSource::Vocab {
                vocab,
                config: tokenizer_config.is_file().then_some(tokenizer_config),
            }
        };

        Ok(ModelFiles {
            config,
            weights,
            tokenizer,
        })
    }

    async fn hub_files(model_id: &str, revision: &str, use_pth: bool) -> Result<ModelFiles> {
        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new()?;
        let api = api.repo(repo);

        let config = api.get("config.json").await?;
        let weights = if use_pth {
            api.get("pytorch_model.bin").await?
        } else {
            api.get("model.safetensors").await?
        };
        let tokenizer = match api.get("tokenizer.json").await {
            Ok(path) => TokenizerSource::Json(path),
            Err(err) => {
                tracing::debug!("No tokenizer.json on the Hub ({err}), falling back to vocab.txt");
                TokenizerSource::Vocab {
                    vocab: api.get("vocab.txt").await?,
                    config: api.get("tokenizer_config.json").await.ok(),
                }
            }
        };

        Ok(ModelFiles {
            config,
            weights,
            tokenizer,
        })
    }
}

/// Builds a tokenizer that always emits exactly `max_length` tokens.
fn load_tokenizer(source: &TokenizerSource, max_length: usize) -> Result<Tokenizer> {
    let mut tokenizer = match source {
        TokenizerSource::Json(path) => {
            Tokenizer::from_file(path).map_err(|e| anyhow!("Tokenizer error: {e}"))?
        }
        TokenizerSource::Vocab { vocab, config } => {
            let tokenizer_config = match config {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)
                    .context("Invalid tokenizer_config.json")?,
                None => TokenizerConfig::default(),
            };
            wordpiece_tokenizer(vocab, tokenizer_config.do_lower_case)?
        }
    };

    let pad_id = tokenizer.token_to_id("[PAD]").unwrap_or(0);
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(max_length),
        pad_id,
        pad_token: "[PAD]".to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Tokenizer truncation error: {e}"))?;

    Ok(tokenizer)
}

/// Rebuilds a BERT WordPiece tokenizer from a bare `vocab.txt`.
fn wordpiece_tokenizer(vocab: &Path, lowercase: bool) -> Result<Tokenizer> {
    let wordpiece = WordPiece::from_file(&vocab.to_string_lossy())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| anyhow!("WordPiece vocabulary error: {e}"))?;

    let mut tokenizer = Tokenizer::new(wordpiece);
    let (Some(cls_id), Some(sep_id)) = (
        tokenizer.token_to_id("[CLS]"),
        tokenizer.token_to_id("[SEP]"),
    ) else {
        bail!("Vocabulary {} lacks [CLS] or [SEP]", vocab.display());
    };

    tokenizer
        .with_normalizer(BertNormalizer::new(true, true, None, lowercase))
        .with_pre_tokenizer(BertPreTokenizer)
        .with_post_processor(BertProcessing::new(
            ("[SEP]".to_string(), sep_id),
            ("[CLS]".to_string(), cls_id),
        ));

    Ok(tokenizer)
}

impl BertInner {
    /// Wires the encoder, pooler and classifier head to the weights under `vb`.
    fn load(
        vb: VarBuilder,
        bert_config: &BertModelConfig,
        hidden_size: usize,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        let model = BertModel::load(vb.pp("bert"), bert_config)
            .context("Failed to load BERT encoder weights")?;
        let pooler = candle_nn::linear(
            hidden_size,
            hidden_size,
            vb.pp("bert").pp("pooler").pp("dense"),
        )
        .context("Failed to load pooler weights")?;
        let classifier = candle_nn::linear(hidden_size, NUM_CLASSES, vb.pp("classifier"))
            .context("Failed to load classifier weights")?;

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            device,
        })
    }

    fn forward(&self, texts: Vec<String>) -> Result<Vec<Classification>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| anyhow!("Tokenization error: {e}"))?;

        let to_tensor = |rows: Vec<&[u32]>| -> Result<Tensor> {
            let rows = rows
                .into_iter()
                .map(|row| Tensor::new(row, &self.device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::stack(&rows, 0)?)
        };

        let input_ids = to_tensor(encodings.iter().map(|e| e.get_ids()).collect())?;
        let token_type_ids = to_tensor(encodings.iter().map(|e| e.get_type_ids()).collect())?;
        let attention_mask =
            to_tensor(encodings.iter().map(|e| e.get_attention_mask()).collect())?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        let probs = softmax(&logits, 1)?.to_vec2::<f32>()?;

        probs.into_iter().map(Classification::from_probs).collect()
    }
}

#[async_trait]
impl BatchedClassifier for BertBatchedClassifier {
    #[tracing::instrument(skip(self, texts), fields(batch_size = texts.len()))]
    async fn classify_batch(&self, texts: Vec<String>) -> Result<Vec<Classification>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.forward(texts)).await?
    }
}
