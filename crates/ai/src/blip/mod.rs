use crate::generation::{beam_search, GenerationParams};
use crate::hub::ArtifactSource;
use crate::preprocess::{image_to_tensor, BLIP_IMAGE_MEAN, BLIP_IMAGE_STD};
use crate::traits::{ImageCaptionError, ImageCaptionInput, ImageCaptionOutput};
use crate::utils::select_device;
use crate::Model;
use anyhow::{anyhow, bail};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::VisionConfig;
use candle_transformers::models::quantized_blip;
use candle_transformers::models::{blip, blip_text};
use strum_macros::{AsRefStr, EnumString};
use tokenizers::Tokenizer;
use tracing::debug;

/// `[DEC]`, prepended to every decoder input.
pub const DECODER_START_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: 384,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BLIPModel {
    Base,
    #[default]
    Large,
}

impl BLIPModel {
    fn config(&self) -> blip::Config {
        match self {
            BLIPModel::Base => blip_base_config(),
            BLIPModel::Large => blip::Config::image_captioning_large(),
        }
    }
}

/// On-disk weight format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ModelFormat {
    #[default]
    Safetensors,
    Gguf,
}

#[derive(Debug, Clone)]
pub struct BLIPOptions {
    pub model: ArtifactSource,
    pub tokenizer: ArtifactSource,
    pub model_type: BLIPModel,
    pub format: ModelFormat,
    pub generation: GenerationParams,
    pub cpu: bool,
}

enum BlipWeights {
    Full(blip::BlipForConditionalGeneration),
    Quantized(quantized_blip::BlipForConditionalGeneration),
}

impl BlipWeights {
    fn embed_image(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            BlipWeights::Full(model) => model.vision_model().forward(pixel_values),
            BlipWeights::Quantized(model) => model.vision_model().forward(pixel_values),
        }
    }

    fn decode(&mut self, input_ids: &Tensor, image_embeds: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            BlipWeights::Full(model) => model.text_decoder().forward(input_ids, image_embeds),
            BlipWeights::Quantized(model) => model.text_decoder().forward(input_ids, image_embeds),
        }
    }

    fn reset_kv_cache(&mut self) {
        match self {
            BlipWeights::Full(model) => model.text_decoder().reset_kv_cache(),
            BlipWeights::Quantized(model) => model.text_decoder().reset_kv_cache(),
        }
    }

    /// Log-probabilities of the next token after the full sequence `tokens`.
    fn next_log_probs(
        &mut self,
        tokens: &[u32],
        image_embeds: &Tensor,
        device: &Device,
    ) -> candle_core::Result<Vec<f32>> {
        self.reset_kv_cache();
        let input_ids = Tensor::new(tokens, device)?.unsqueeze(0)?;
        let logits = last_logits(&self.decode(&input_ids, image_embeds)?)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1::<f32>()
    }
}

fn last_logits(logits: &Tensor) -> candle_core::Result<Tensor> {
    let logits = logits.squeeze(0)?;
    logits.get(logits.dim(0)? - 1)?.to_dtype(DType::F32)
}

/// Decoder prefix for an optional conditional prompt.
///
/// The tokenizer's leading `[CLS]` is replaced by `[DEC]` and the trailing
/// `[SEP]` is dropped so generation continues the prompt.
fn prompt_tokens(tokenizer: &Tokenizer, prompt: Option<&str>) -> anyhow::Result<Vec<u32>> {
    let prompt = match prompt.map(str::trim) {
        Some(prompt) if !prompt.is_empty() => prompt,
        _ => return Ok(vec![DECODER_START_TOKEN_ID]),
    };

    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| anyhow!("failed to tokenize prompt: {}", e))?;
    let mut token_ids = encoding.get_ids().to_vec();
    if token_ids.last() == Some(&SEP_TOKEN_ID) {
        token_ids.pop();
    }
    match token_ids.first_mut() {
        Some(first) => *first = DECODER_START_TOKEN_ID,
        None => token_ids.push(DECODER_START_TOKEN_ID),
    }

    Ok(token_ids)
}

pub struct BLIP {
    tokenizer: Tokenizer,
    model: BlipWeights,
    logits_processor: LogitsProcessor,
    generation: GenerationParams,
    image_size: u32,
    device: Device,
}

impl Model for BLIP {
    type Item = ImageCaptionInput;
    type Output = ImageCaptionOutput;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            bail!("too many items");
        }

        let mut results = vec![];

        for item in items {
            let res = self.get_caption(item);
            results.push(res);
        }

        Ok(results)
    }
}

impl BLIP {
    pub async fn new(options: BLIPOptions) -> anyhow::Result<Self> {
        let model_path = options.model.resolve().await?;
        let tokenizer_path = options.tokenizer.resolve().await?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to initialize tokenizer: {}", e))?;

        let logits_processor = LogitsProcessor::new(options.generation.seed, None, None);
        let config = options.model_type.config();
        let device = select_device(options.cpu)?;

        tracing::info!(
            "loading BLIP {} ({}) from {} on {:?}",
            options.model_type.as_ref(),
            options.format.as_ref(),
            model_path.display(),
            device
        );

        let model = match options.format {
            ModelFormat::Safetensors => {
                // SAFETY: the weights file is not modified while it is mapped
                let vb = unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(
                        &[model_path],
                        DType::F32,
                        &device,
                    )?
                };
                BlipWeights::Full(blip::BlipForConditionalGeneration::new(&config, vb)?)
            }
            ModelFormat::Gguf => {
                let vb = quantized_blip::VarBuilder::from_gguf(&model_path, &device)?;
                BlipWeights::Quantized(quantized_blip::BlipForConditionalGeneration::new(
                    &config, vb,
                )?)
            }
        };

        Ok(Self {
            tokenizer,
            model,
            logits_processor,
            generation: options.generation,
            image_size: config.vision_config.image_size as u32,
            device,
        })
    }

    fn get_caption(&mut self, input: ImageCaptionInput) -> anyhow::Result<String> {
        debug!(
            "generating caption for {}x{} image",
            input.image.width(),
            input.image.height()
        );

        let pixel_values = image_to_tensor(
            &input.image,
            self.image_size,
            BLIP_IMAGE_MEAN,
            BLIP_IMAGE_STD,
            &self.device,
        )
        .map_err(ImageCaptionError::preprocess)?;
        let prefix = prompt_tokens(&self.tokenizer, input.prompt.as_deref())
            .map_err(ImageCaptionError::preprocess)?;

        let token_ids = self
            .generate(&pixel_values, &prefix)
            .map_err(ImageCaptionError::generate)?;

        // drop the decoder start token, keep the prompt
        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(ImageCaptionError::generate)?;

        Ok(caption.trim().to_string())
    }

    fn generate(&mut self, pixel_values: &Tensor, prefix: &[u32]) -> anyhow::Result<Vec<u32>> {
        self.generation.validate(prefix.len())?;

        let image_embeds = self.model.embed_image(&pixel_values.unsqueeze(0)?)?;

        if self.generation.num_beams == 1 {
            return self.greedy(&image_embeds, prefix);
        }

        let model = &mut self.model;
        let device = &self.device;
        beam_search(&self.generation, prefix, SEP_TOKEN_ID, |tokens| {
            Ok(model.next_log_probs(tokens, &image_embeds, device)?)
        })
    }

    fn greedy(&mut self, image_embeds: &Tensor, prefix: &[u32]) -> anyhow::Result<Vec<u32>> {
        let mut token_ids = prefix.to_vec();

        // we need this to make multi time generation work
        self.model.reset_kv_cache();

        for index in 0..(self.generation.max_length - prefix.len()) {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = last_logits(&self.model.decode(&input_ids, image_embeds)?)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        Ok(token_ids)
    }
}
