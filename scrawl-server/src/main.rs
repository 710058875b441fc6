use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use hf_hub::api::tokio::Api;
use scrawl_core::{
    load_pipeline, predict, DeviceMap, PipelineLike, PredictRequest, WeightLocations,
    DEFAULT_CONTROLNET_DIR, DEFAULT_WEIGHTS_DIR,
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio::{self, net::TcpListener, sync::Mutex};
use tracing::{error, info};
use uuid::Uuid;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Scrawl image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Directory holding the main pipeline weights
    #[arg(long, default_value = DEFAULT_WEIGHTS_DIR)]
    weights_dir: PathBuf,

    /// Directory holding the conditioning-model weights
    #[arg(long, default_value = DEFAULT_CONTROLNET_DIR)]
    controlnet_dir: PathBuf,

    /// Tokenizer file to use instead of the bundled/hub one
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize)]
struct PredictionOutput {
    path: String,
    image: String,
}

#[derive(Serialize)]
struct PredictionResponse {
    id: String,
    outputs: Vec<PredictionOutput>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// Application state containing the preloaded pipeline. The mutex serializes
// requests against the single GPU-resident engine: one prediction at a time,
// no cancellation, no retries.
struct AppState {
    pipeline: Arc<dyn PipelineLike>,
    engine_lock: Mutex<()>,
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> impl IntoResponse {
    match run_prediction(request, &state).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            let status = match &e {
                scrawl_core::Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(error = %e, "prediction failed");
            (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Runs one prediction against the shared engine and assembles the response.
async fn run_prediction(
    request: PredictRequest,
    state: &AppState,
) -> scrawl_core::Result<PredictionResponse> {
    // Reject bad parameters before taking the engine lock.
    request.validate()?;
    let id = Uuid::new_v4().to_string();
    info!(id, "accepted prediction request");

    let _guard = state.engine_lock.lock().await;
    let pipeline = state.pipeline.clone();
    let paths = tokio::task::spawn_blocking(move || predict(pipeline.as_ref(), request))
        .await
        .map_err(|e| scrawl_core::Error::internal(format!("prediction task panicked: {e}")))??;

    let mut outputs = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = tokio::fs::read(path).await?;
        outputs.push(PredictionOutput {
            path: path.display().to_string(),
            image: BASE64_STANDARD.encode(&bytes),
        });
    }
    info!(id, outputs = outputs.len(), "prediction finished");
    Ok(PredictionResponse { id, outputs })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let mut weights = WeightLocations::new(args.weights_dir, args.controlnet_dir);
    if let Some(tokenizer) = args.tokenizer {
        weights = weights.with_tokenizer_file(tokenizer);
    }

    let pipeline = load_pipeline(weights, Api::new()?, device_map).await?;

    // Build application state and wrap in Arc.
    let state = Arc::new(AppState {
        pipeline,
        engine_lock: Mutex::new(()),
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/predictions", post(predict_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
