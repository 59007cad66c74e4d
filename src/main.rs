use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{multipart_error, ServiceResult};
use crate::inference::models::whisper::WhisperModel;
use crate::inference::task::transcribe::{TranscribeHandler, TranscribeResponse};

mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "TranscribeService.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

/// Per-request transcription settings shared by all handlers.
#[derive(Debug)]
pub(crate) struct TranscribeSettings {
    pub(crate) language: String,
    pub(crate) temp_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    model: Arc<OnceLock<Arc<dyn TranscribeHandler>>>,
    settings: Arc<TranscribeSettings>,
}

impl AppState {
    pub(crate) fn new(settings: TranscribeSettings) -> Self {
        Self {
            model: Arc::new(OnceLock::new()),
            settings: Arc::new(settings),
        }
    }

    /// Marks the service ready. Only the first installed model is kept.
    pub(crate) fn install_model(&self, model: Arc<dyn TranscribeHandler>) {
        if self.model.set(model).is_err() {
            warn!("A model is already installed, ignoring the new one");
        }
    }

    fn model(&self) -> Option<Arc<dyn TranscribeHandler>> {
        self.model.get().cloned()
    }

    fn readiness(&self) -> Readiness {
        if self.model.get().is_some() {
            Readiness::Ready
        } else {
            Readiness::Uninitialized
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Readiness {
    Uninitialized,
    Ready,
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    status: Readiness,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let fallback = args.config_file == DEFAULT_CONFIG_FILE;
    let config = load_config(&args.config_file, fallback)?.merge(args.opt_config);
    telemetry::init_telemetry(config.otlp_endpoint.as_deref(), config.console)?;

    let state = AppState::new(TranscribeSettings {
        language: config.language.clone(),
        temp_dir: config.temp_dir.clone(),
    });
    spawn_model_loader(&config, state.clone());

    let app = router(state, config.max_upload_bytes);
    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    match config.tls_paths() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("Failed to load TLS certificate or key")?;
            let handle = axum_server::Handle::new();
            tokio::spawn(shutdown_tls(handle.clone()));
            axum_server::tls_rustls::from_tcp_rustls(listener.into_std()?, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }
    Ok(())
}

/// With `fallback` set a missing file yields the built-in defaults. Unreadable or
/// malformed files are always an error.
fn load_config(path: &str, fallback: bool) -> Result<Config> {
    match Config::from_toml(path) {
        Ok(config) => Ok(config),
        Err(err)
            if fallback
                && err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|err| err.kind() == std::io::ErrorKind::NotFound) =>
        {
            Ok(Config::default())
        }
        Err(err) => Err(err.context(format!("Failed to read configuration file {path}"))),
    }
}

/// Loads the model off the async runtime. The service reports itself uninitialized until
/// this finishes and exits if loading fails.
fn spawn_model_loader(config: &Config, state: AppState) {
    let which = config.model;
    let mel_filters = config.mel_filters.clone();
    let console = telemetry::logs_to_console(config.otlp_endpoint.as_deref(), config.console);
    tokio::task::spawn_blocking(move || {
        info!("Loading Whisper model {which:?}, this may take a moment");
        let loaded = Api::new()
            .map_err(anyhow::Error::from)
            .and_then(|api| WhisperModel::new(&api, which, &mel_filters));
        match loaded {
            Ok(model) => {
                state.install_model(Arc::new(model));
                info!("Model loaded, ready to transcribe");
            }
            Err(err) => {
                if !console {
                    eprintln!("Failed to load model: {err:#}");
                }
                exit_err!(1, "Failed to load model: {:#}", err)
            }
        }
    });
}

pub(crate) fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/transcribe", post(handle_transcribe_request))
        .route("/health", get(handle_health_request))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

async fn shutdown_tls(handle: axum_server::Handle) {
    shutdown_signal().await;
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

#[axum_macros::debug_handler]
async fn handle_health_request(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let status = state.readiness();
    let code = match status {
        Readiness::Ready => StatusCode::OK,
        Readiness::Uninitialized => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(HealthResponse { status }))
}

#[axum_macros::debug_handler]
async fn handle_transcribe_request(
    State(state): State<AppState>,
    multipart: Option<Multipart>,
) -> ServiceResult<Json<TranscribeResponse>> {
    let mut upload = None;
    if let Some(mut multipart) = multipart {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            if field.name() != Some("file") {
                continue;
            }
            // A part without a filename is a plain form value, not an upload
            let Some(file_name) = field.file_name().map(ToOwned::to_owned) else {
                continue;
            };
            upload = Some((file_name, field.bytes().await.map_err(multipart_error)?));
            break;
        }
    }

    let Some((file_name, bytes)) = upload else {
        bail_service!(StatusCode::BAD_REQUEST, "No file provided")
    };
    if file_name.is_empty() {
        bail_service!(StatusCode::BAD_REQUEST, "No file selected")
    }
    let Some(model) = state.model() else {
        bail_service!(StatusCode::SERVICE_UNAVAILABLE, "Model is not loaded yet")
    };

    let settings = Arc::clone(&state.settings);
    let text = tokio::task::spawn_blocking(move || {
        transcribe_upload(model.as_ref(), &settings, &file_name, &bytes)
    })
    .await??;

    Ok(Json(TranscribeResponse { text }))
}

/// Writes the upload to its own temporary file and transcribes it.
///
/// The file is removed when the guard drops, so failed transcriptions do not leave it behind.
fn transcribe_upload(
    model: &dyn TranscribeHandler,
    settings: &TranscribeSettings,
    file_name: &str,
    bytes: &[u8],
) -> Result<String> {
    let suffix = Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut builder = tempfile::Builder::new();
    builder.prefix("transcribe-").suffix(&suffix);
    let mut audio_file = match &settings.temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .context("Failed to create temporary audio file")?;
    audio_file.write_all(bytes)?;
    audio_file.flush()?;

    let transcript = model.run_transcribe(audio_file.path(), &settings.language)?;
    audio_file
        .close()
        .context("Failed to remove temporary audio file")?;

    Ok(transcript.trim().to_string())
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            tracing::error!($fmt $(, $arg)*);
            $crate::telemetry::shutdown();
            std::process::exit($code);
        }
    };
}
