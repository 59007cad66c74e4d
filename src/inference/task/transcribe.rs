use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug)]
pub struct TranscribeResponse {
    pub text: String,
}

/// Speech to text over an audio file on disk.
pub trait TranscribeHandler: Send + Sync {
    /// Returns the raw transcript of `audio_path`, recognised as `language`.
    fn run_transcribe(&self, audio_path: &Path, language: &str) -> Result<String>;
}
