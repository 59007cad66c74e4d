use std::path::PathBuf;

use anyhow::Result;
use clap_serde_derive::ClapSerde;

use crate::inference::models::whisper::WhichModel;

#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default(String::from("0.0.0.0"))]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(5001)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Language code forced on every transcription
    #[default(String::from("ur"))]
    #[arg(short, long, env)]
    pub(crate) language: String,

    /// Whisper model variant loaded at startup
    #[default(WhichModel::Small)]
    #[arg(short, long, env, value_enum)]
    pub(crate) model: WhichModel,

    /// Path to the little endian f32 mel filter bank, large-v3 needs the 128 bin one
    #[default(PathBuf::from("melfilters.bytes"))]
    #[arg(long, env)]
    pub(crate) mel_filters: PathBuf,

    /// Directory for the per-request audio files, defaults to the system temp directory
    #[arg(long, env)]
    pub(crate) temp_dir: Option<PathBuf>,

    /// Maximum accepted request body size in bytes
    #[default(25_000_000)]
    #[arg(long, env)]
    pub(crate) max_upload_bytes: usize,

    /// OTLP collector endpoint, telemetry export is disabled when unset
    #[arg(long, env)]
    pub(crate) otlp_endpoint: Option<String>,

    /// Keep console logging when exporting telemetry
    #[arg(long, env)]
    pub(crate) console: bool,

    /// PEM certificate chain, enables TLS together with tls_key
    #[arg(long, env)]
    pub(crate) tls_cert: Option<PathBuf>,

    /// PEM private key, enables TLS together with tls_cert
    #[arg(long, env)]
    pub(crate) tls_key: Option<PathBuf>,
}

impl Config {
    /// Reads a possibly partial configuration, unset keys keep their defaults.
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert.as_ref().zip(self.tls_key.as_ref())
    }
}
