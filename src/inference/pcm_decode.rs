#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// Decodes the audio file at `path` into mono f32 samples at `target_rate`.
///
/// The file extension, when present, is used as a container hint. Multi channel
/// audio is averaged down to mono before resampling.
pub fn pcm_decode(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Unsupported audio format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No supported audio track found")?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let Some(sample_rate) = codec_params.sample_rate else {
        bail!("Audio track does not declare a sample rate")
    };

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("Unsupported audio codec")?;

    let mut pcm_data = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(err.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        pcm_data.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    if pcm_data.is_empty() {
        bail!("No audio samples could be decoded")
    }
    debug!(
        samples = pcm_data.len(),
        sample_rate, "decoded audio track"
    );

    if sample_rate == target_rate {
        return Ok(pcm_data);
    }
    resample(&pcm_data, sample_rate, target_rate)
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_SIZE, 1)?;

    let expected_len = (samples.len() as f64 * ratio).ceil() as usize;
    // The first output frames are filter warm-up, not signal
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(delay + expected_len + RESAMPLE_CHUNK_SIZE);
    let mut chunks = samples.chunks(RESAMPLE_CHUNK_SIZE);
    while output.len() < delay + expected_len {
        let mut input = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        // Last chunk is zero padded, further zero chunks flush the filter
        input.resize(RESAMPLE_CHUNK_SIZE, 0.0);
        let resampled = resampler.process(&vec![input], None)?;
        match resampled.first() {
            Some(channel) if !channel.is_empty() => output.extend_from_slice(channel),
            _ => bail!("Resampler produced no output"),
        }
    }
    output.drain(..delay);
    output.truncate(expected_len);
    debug!(from_rate, to_rate, samples = output.len(), "resampled audio");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn silent_wav(sample_rate: u32, channels: u16, num_samples: u32) -> Vec<u8> {
        constant_wav(sample_rate, channels, num_samples, 0)
    }

    /// Minimal PCM16 WAV file where every sample has the same value.
    fn constant_wav(sample_rate: u32, channels: u16, num_samples: u32, value: i16) -> Vec<u8> {
        let bits_per_sample: u16 = 16;
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
        let block_align = channels * bits_per_sample / 8;
        let data_size = num_samples * u32::from(channels) * u32::from(bits_per_sample) / 8;

        let mut buf = Vec::with_capacity(44 + data_size as usize);
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&(36 + data_size).to_le_bytes());
        buf.extend_from_slice(b"WAVE");
        buf.extend_from_slice(b"fmt ");
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&channels.to_le_bytes());
        buf.extend_from_slice(&sample_rate.to_le_bytes());
        buf.extend_from_slice(&byte_rate.to_le_bytes());
        buf.extend_from_slice(&block_align.to_le_bytes());
        buf.extend_from_slice(&bits_per_sample.to_le_bytes());
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&data_size.to_le_bytes());
        for _ in 0..num_samples * u32::from(channels) {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }

    fn write_temp(suffix: &str, bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn decodes_16khz_mono_without_resampling() {
        let file = write_temp(".wav", &silent_wav(16_000, 1, 1600));
        let samples = pcm_decode(file.path(), 16_000).unwrap();
        assert_eq!(samples.len(), 1600);
        assert!(samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn downmixes_and_resamples_to_target_rate() {
        // 0.5s of 44.1kHz stereo
        let file = write_temp(".wav", &silent_wav(44_100, 2, 22_050));
        let samples = pcm_decode(file.path(), 16_000).unwrap();
        let ratio = samples.len() as f64 / 8000.0;
        assert!((ratio - 1.0).abs() < 0.05, "got {} samples", samples.len());
    }

    #[test]
    fn resampled_signal_starts_without_warm_up() {
        // 0.5s of 44.1kHz mono at half scale
        let file = write_temp(".wav", &constant_wav(44_100, 1, 22_050, i16::MAX / 2));
        let samples = pcm_decode(file.path(), 16_000).unwrap();
        assert!((8000..=8001).contains(&samples.len()), "got {}", samples.len());

        // Warm-up frames would be close to zero here
        for sample in &samples[20..40] {
            assert!((sample - 0.5).abs() < 0.05, "got {sample}");
        }
    }

    #[test]
    fn rejects_garbage() {
        let file = write_temp(".wav", b"definitely not audio");
        assert!(pcm_decode(file.path(), 16_000).is_err());
    }

    #[test]
    fn rejects_empty_file() {
        let file = write_temp(".wav", b"");
        assert!(pcm_decode(file.path(), 16_000).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = pcm_decode(Path::new("/nonexistent/audio.wav"), 16_000).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/audio.wav"));
    }
}
