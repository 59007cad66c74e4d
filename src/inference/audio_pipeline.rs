#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{bail, Context, Error, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper::{
    self as m, audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH,
    LOGPROB_THRESHOLD, NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE,
    SOT_TOKEN, TEMPERATURES, TRANSCRIBE_TOKEN,
};
use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, error};

use crate::inference::pcm_decode::pcm_decode;

/// Whisper weights, either full precision safetensors or a quantized gguf file.
#[derive(Clone)]
pub enum Model {
    Normal(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl Model {
    pub fn config(&self) -> &Config {
        match self {
            Self::Normal(m) => &m.config,
            Self::Quantized(m) => &m.config,
        }
    }

    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.encoder.forward(x, flush),
            Self::Quantized(m) => m.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(
        &mut self,
        x: &Tensor,
        xa: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.decoder.forward(x, xa, flush),
            Self::Quantized(m) => m.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Normal(m) => m.decoder.final_linear(x),
            Self::Quantized(m) => m.decoder.final_linear(x),
        }
    }
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: Model,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    pub fn new(
        model: Model,
        tokenizer: Tokenizer,
        mel_filters: Vec<f32>,
        seed: rand::rngs::StdRng,
    ) -> Result<Self> {
        let config = model.config();
        check_mel_filters(config.num_mel_bins, &mel_filters)?;

        let suppress_tokens: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;
        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let Some(no_speech_token) = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
        else {
            bail!("Unable to find any non-speech token")
        };

        Ok(Self {
            model,
            tokenizer,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            seed,
        })
    }

    /// Transcribes the audio file at `audio_path`, forcing `language` instead of detecting it.
    pub fn transcribe(&mut self, audio_path: &Path, language: &str) -> Result<Vec<Segment>> {
        let language_token = language_token(&self.tokenizer, language)?;

        let mel = self.load_mel(audio_path)?;
        let (_, _, content_frames) = mel.dims3()?;
        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, m::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_segment, language_token)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            debug!(
                "{:.1}s -- {:.1}s: {}",
                time_offset,
                time_offset + segment_duration,
                dr.text,
            );
            segments.push(Segment {
                start: time_offset,
                duration: segment_duration,
                dr,
            });
        }
        Ok(segments)
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: u32,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(segment, t, language_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        bail!("No decoding temperatures configured")
    }

    fn decode(&mut self, mel: &Tensor, t: f64, language_token: u32) -> Result<DecodingResult> {
        let audio_features = self.model.encoder_forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let max_target_positions = self.model.config().max_target_positions;
        let sample_len = max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![
            self.sot_token,
            language_token,
            self.transcribe_token,
            self.no_timestamps_token,
        ];

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = self
                .model
                .decoder_forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = self.model.decoder_final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder_final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                sample_token(&prs.to_vec1()?, &mut self.seed)?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .context("Decoder produced empty logits")?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self.tokenizer.decode(&tokens, true).map_err(Error::msg)?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio: f64::NAN,
        })
    }

    fn load_mel(&self, audio_path: &Path) -> Result<Tensor> {
        let pcm_data = pcm_decode(audio_path, u32::try_from(SAMPLE_RATE)?)?;
        debug!("pcm data loaded {}", pcm_data.len());
        let config = self.model.config();
        let mel = audio::pcm_to_mel(config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (1, config.num_mel_bins, mel_len / config.num_mel_bins),
            &Device::Cpu,
        )?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Segment {
    start: f64,
    duration: f64,
    dr: DecodingResult,
}

impl Segment {
    pub fn text(&self) -> &str {
        &self.dr.text
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DecodingResult {
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}

/// Id of the `<|code|>` token that forces the decoding language.
pub fn language_token(tokenizer: &Tokenizer, language: &str) -> Result<u32> {
    match tokenizer.token_to_id(&format!("<|{language}|>")) {
        None => bail!("language {language} is not supported"),
        Some(id) => Ok(id),
    }
}

fn sample_token(probs: &[f32], rng: &mut rand::rngs::StdRng) -> Result<u32> {
    let distr = rand::distributions::WeightedIndex::new(probs)?;
    Ok(u32::try_from(distr.sample(rng))?)
}

fn check_mel_filters(num_mel_bins: usize, mel_filters: &[f32]) -> Result<()> {
    let expected = num_mel_bins * (m::N_FFT / 2 + 1);
    if mel_filters.len() != expected {
        bail!(
            "Mel filter bank has {} values, the model expects {}",
            mel_filters.len(),
            expected
        )
    }
    Ok(())
}

/// Reads a mel filter bank stored as little endian f32 values.
pub fn read_mel_filters(path: &Path) -> Result<Vec<f32>> {
    let mel_bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read mel filters from {}", path.display()))?;
    if mel_bytes.len() % 4 != 0 {
        bail!(
            "Mel filter file {} is not a sequence of f32 values",
            path.display()
        )
    }
    let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
    <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(&mel_bytes, &mut mel_filters);
    Ok(mel_filters)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rand::SeedableRng;

    use super::*;

    fn language_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "<|en|>": 1, "<|ur|>": 2 },
                "unk_token": "[UNK]"
            }
        }"#;
        Tokenizer::from_bytes(json.as_bytes()).unwrap()
    }

    #[test]
    fn resolves_known_language_tokens() {
        let tokenizer = language_tokenizer();
        assert_eq!(language_token(&tokenizer, "ur").unwrap(), 2);
        assert_eq!(language_token(&tokenizer, "en").unwrap(), 1);
    }

    #[test]
    fn unknown_language_is_not_supported() {
        let err = language_token(&language_tokenizer(), "xx").unwrap_err();
        assert_eq!(err.to_string(), "language xx is not supported");
    }

    #[test]
    fn mel_filter_count_must_match_the_model() {
        let per_bin = m::N_FFT / 2 + 1;
        assert!(check_mel_filters(80, &vec![0.0; 80 * per_bin]).is_ok());

        let err = check_mel_filters(128, &vec![0.0; 80 * per_bin]).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Mel filter bank has {} values, the model expects {}",
                80 * per_bin,
                128 * per_bin
            )
        );
    }

    #[test]
    fn cloned_seeds_sample_the_same_tokens() {
        let probs = [0.1f32, 0.2, 0.3, 0.4];
        let seed = rand::rngs::StdRng::from_seed([0; 32]);

        let mut first = seed.clone();
        let mut second = seed;
        let a: Vec<u32> = (0..32)
            .map(|_| sample_token(&probs, &mut first).unwrap())
            .collect();
        let b: Vec<u32> = (0..32)
            .map(|_| sample_token(&probs, &mut second).unwrap())
            .collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|t| *t < 4));
    }

    #[test]
    fn sampling_needs_some_probability_mass() {
        let mut rng = rand::rngs::StdRng::from_seed([0; 32]);
        assert!(sample_token(&[0.0, 0.0], &mut rng).is_err());
    }

    #[test]
    fn reads_little_endian_mel_filters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for value in [0.5f32, -1.25, 3.0] {
            file.write_all(&value.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();

        let filters = read_mel_filters(file.path()).unwrap();
        assert_eq!(filters, vec![0.5, -1.25, 3.0]);
    }

    #[test]
    fn rejects_truncated_mel_filters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 7]).unwrap();
        file.flush().unwrap();

        assert!(read_mel_filters(file.path()).is_err());
    }

    #[test]
    fn segment_exposes_decoded_text() {
        let segment = Segment {
            start: 0.0,
            duration: 30.0,
            dr: DecodingResult {
                text: " سلام".into(),
                avg_logprob: -0.2,
                no_speech_prob: 0.01,
                temperature: 0.0,
                compression_ratio: f64::NAN,
            },
        };
        assert_eq!(segment.text(), " سلام");
    }
}
