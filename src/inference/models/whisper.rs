use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::Device;
use candle_transformers::models::whisper::{self as m, Config};
use clap::ValueEnum;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use rand::SeedableRng;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use crate::inference::audio_pipeline::{read_mel_filters, AudioGeneratorPipeline, Model, Segment};
use crate::inference::models::model::ModelBase;
use crate::inference::task::transcribe::TranscribeHandler;

/// Whisper checkpoints the service knows how to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WhichModel {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV3,
    TinyQuantized,
}

impl WhichModel {
    pub fn base(self) -> ModelBase {
        let (name, repo_id, repo_revision) = match self {
            Self::Tiny => ("Whisper Tiny", "openai/whisper-tiny", "main"),
            Self::Base => ("Whisper Base", "openai/whisper-base", "refs/pr/22"),
            Self::Small => ("Whisper Small", "openai/whisper-small", "main"),
            Self::Medium => ("Whisper Medium", "openai/whisper-medium", "main"),
            Self::LargeV3 => ("Whisper Large v3", "openai/whisper-large-v3", "main"),
            Self::TinyQuantized => ("Candle Whisper Tiny q4k", "lmz/candle-whisper", "main"),
        };
        ModelBase {
            name: name.into(),
            repo_id: repo_id.into(),
            repo_revision: repo_revision.into(),
        }
    }

    /// Mel bins the checkpoint was trained with, the filter bank has to match.
    pub fn num_mel_bins(self) -> usize {
        match self {
            Self::LargeV3 => 128,
            _ => 80,
        }
    }

    fn is_quantized(self) -> bool {
        matches!(self, Self::TinyQuantized)
    }

    /// Config, tokenizer and weights file names inside the model repository.
    fn filenames(self) -> (&'static str, &'static str, &'static str) {
        if self.is_quantized() {
            ("config-tiny.json", "tokenizer-tiny.json", "model-tiny-q4k.gguf")
        } else {
            ("config.json", "tokenizer.json", "model.safetensors")
        }
    }
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct WhisperModel {
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(api))]
    pub fn new(api: &Api, which: WhichModel, mel_filters_path: &Path) -> Result<Self> {
        let base = which.base();
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let (config_filename, tokenizer_filename, weights_filename) = which.filenames();

        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let weights_path = repo.get(weights_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::msg)?;

        let device = Device::Cpu;
        let model = if which.is_quantized() {
            let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                &weights_path,
                &device,
            )?;
            Model::Quantized(m::quantized_model::Whisper::load(&vb, config)?)
        } else {
            // SAFETY: the weights live in the read-only hub cache and are not modified while mapped.
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)?
            };
            Model::Normal(m::model::Whisper::load(&vb, config)?)
        };

        let generator_pipeline = AudioGeneratorPipeline::new(
            model,
            tokenizer,
            read_mel_filters(mel_filters_path)?,
            rand::rngs::StdRng::from_seed([0; 32]),
        )
        .with_context(|| {
            format!(
                "{} needs a {}-bin mel filter bank",
                base.name,
                which.num_mel_bins()
            )
        })?;
        info!(model = %base.name, repo = %base.repo_id, "Whisper model loaded");

        Ok(Self { generator_pipeline })
    }
}

impl TranscribeHandler for WhisperModel {
    /// Each call decodes on its own copy of the pipeline, the weights stay shared.
    #[tracing::instrument(level = "info", skip(self))]
    fn run_transcribe(&self, audio_path: &Path, language: &str) -> Result<String> {
        let mut pipeline = self.generator_pipeline.clone();
        let segments = pipeline.transcribe(audio_path, language)?;
        Ok(segments.iter().map(Segment::text).collect())
    }
}
