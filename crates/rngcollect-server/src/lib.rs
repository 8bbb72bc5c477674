//! HTTP control server for collection sessions.
//!
//! Hosts at most one [`Collector`] at a time. Clients start a session with a
//! JSON body, poll its snapshot, and pause, resume or stop it. Every session
//! is recorded to a capture CSV in the configured output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use rngcollect_core::sources::SourceDescriptor;
use rngcollect_core::{
    CollectError, Collector, CollectorConfig, SessionConfig, SessionSnapshot, SessionWriter, SourceError, SourceKind,
    SourceParams, record, release_or_warn,
};

/// Driver and recorder threads of a session.
#[derive(Default)]
struct SessionThreads {
    driver: Option<JoinHandle<()>>,
    recorder: Option<JoinHandle<std::io::Result<PathBuf>>>,
}

impl SessionThreads {
    /// Wait for both threads once the session has ended. Must not be awaited
    /// while holding the session lock.
    async fn join(self, capture: &Path) {
        let SessionThreads { driver, recorder } = self;
        let joined = tokio::task::spawn_blocking(move || {
            if let Some(d) = driver {
                let _ = d.join();
            }
            recorder.and_then(|r| r.join().ok())
        })
        .await;
        match joined {
            Ok(Some(Err(e))) => warn!("capture {} not finished cleanly: {e}", capture.display()),
            Ok(_) => {}
            Err(e) => warn!("join failed: {e}"),
        }
    }
}

/// One hosted session and the threads serving it.
struct ActiveSession {
    collector: Collector,
    capture: PathBuf,
    threads: SessionThreads,
}

impl ActiveSession {

    fn response(&self) -> SessionResponse {
        SessionResponse {
            session: Some(self.collector.snapshot()),
            capture: Some(self.capture.display().to_string()),
        }
    }
}

/// Shared server state.
pub struct AppState {
    session: Mutex<Option<ActiveSession>>,
    output_dir: PathBuf,
}

impl AppState {
    pub fn new(output_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(None),
            output_dir,
        })
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartParams {
    pub source: String,
    pub sample_size_bits: Option<usize>,
    pub frequency_secs: Option<f64>,
    /// 0 runs until stopped.
    pub duration_secs: Option<f64>,
    pub fold: Option<u8>,
    pub device: Option<PathBuf>,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Option<SessionSnapshot>,
    pub capture: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SourceEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub transport: String,
    pub supports_fold: bool,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<SourceEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

trait JsonWithStatus<T> {
    fn with_status(self, status: StatusCode) -> (StatusCode, Json<T>);
}

impl<T> JsonWithStatus<T> for Json<T> {
    fn with_status(self, status: StatusCode) -> (StatusCode, Json<T>) {
        (status, self)
    }
}

fn api_error(status: StatusCode, msg: impl ToString) -> ApiError {
    Json(ErrorResponse { error: msg.to_string() }).with_status(status)
}

fn collect_error(e: CollectError) -> ApiError {
    let status = match &e {
        CollectError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CollectError::InvalidConfig(_) | CollectError::Source(SourceError::InvalidArgument { .. }) => {
            StatusCode::BAD_REQUEST
        }
        CollectError::Source(SourceError::DeviceUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn no_session() -> ApiError {
    api_error(StatusCode::CONFLICT, "no session has been started")
}

fn seconds(field: &str, value: f64) -> Result<Duration, ApiError> {
    Duration::try_from_secs_f64(value).map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("invalid {field}: {value}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_start(State(state): State<Arc<AppState>>, Json(params): Json<StartParams>) -> ApiResult<SessionResponse> {
    let mut guard = state.session.lock().await;
    if let Some(active) = guard.as_mut() {
        let status = active.collector.status();
        if !status.is_terminal() {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("a session is already {status}"),
            ));
        }
        // A terminal session's threads exit within one wait slice.
        let previous = std::mem::take(&mut active.threads);
        previous.join(&active.capture).await;
    }

    let kind = SourceKind::from_code(&params.source)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, format!("unknown source '{}'", params.source)))?;
    let defaults = CollectorConfig::default();
    let config = CollectorConfig {
        sample_size_bits: params.sample_size_bits.unwrap_or(defaults.sample_size_bits),
        frequency: match params.frequency_secs {
            Some(s) => seconds("frequency_secs", s)?,
            None => defaults.frequency,
        },
        duration: match params.duration_secs {
            Some(s) => seconds("duration_secs", s)?,
            None => defaults.duration,
        },
    };
    let fold = params.fold.unwrap_or(0);
    let descriptor = SourceDescriptor::new(
        kind,
        SourceParams {
            fold_level: fold,
            device_path: params.device,
        },
    );

    let collector = Collector::for_descriptor(descriptor, config.clone()).map_err(collect_error)?;
    let samples = collector.subscribe();
    let starter = collector.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(collect_error)?;

    let writer = match SessionWriter::new(SessionConfig {
        output_dir: state.output_dir.clone(),
        source: kind,
        sample_size_bits: config.sample_size_bits,
        interval: config.frequency,
        fold,
        duration: config.duration,
        note: params.note,
    }) {
        Ok(w) => w,
        Err(e) => {
            let _ = collector.stop();
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("capture file: {e}")));
        }
    };
    let capture = writer.csv_path().to_path_buf();

    let driver = collector.spawn().map_err(|e| {
        let _ = collector.stop();
        collect_error(e)
    })?;
    let rec = collector.clone();
    let recorder = std::thread::Builder::new()
        .name("rngcollect-recorder".into())
        .spawn(move || record(&rec, samples, writer, |_, _| {}))
        .map_err(|e| {
            let _ = collector.stop();
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        })?;

    info!("session started via HTTP: source={kind} capture={}", capture.display());
    let active = ActiveSession {
        collector,
        capture,
        threads: SessionThreads {
            driver: Some(driver),
            recorder: Some(recorder),
        },
    };
    let response = active.response();
    *guard = Some(active);
    Ok(Json(response))
}

async fn handle_pause(State(state): State<Arc<AppState>>) -> ApiResult<SessionResponse> {
    let guard = state.session.lock().await;
    let active = guard.as_ref().ok_or_else(no_session)?;
    active.collector.pause().map_err(collect_error)?;
    Ok(Json(active.response()))
}

async fn handle_resume(State(state): State<Arc<AppState>>) -> ApiResult<SessionResponse> {
    let guard = state.session.lock().await;
    let active = guard.as_ref().ok_or_else(no_session)?;
    active.collector.resume().map_err(collect_error)?;
    Ok(Json(active.response()))
}

/// Stopping may wait on a hung device for the release grace period, so the
/// session lock is only held to look the session up and to take its threads.
async fn handle_stop(State(state): State<Arc<AppState>>) -> ApiResult<SessionResponse> {
    let (collector, capture) = {
        let guard = state.session.lock().await;
        let active = guard.as_ref().ok_or_else(no_session)?;
        (active.collector.clone(), active.capture.clone())
    };

    let stopper = collector.clone();
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(collect_error)?;

    let threads = {
        let mut guard = state.session.lock().await;
        guard
            .as_mut()
            .filter(|active| active.capture == capture)
            .map(|active| std::mem::take(&mut active.threads))
    };
    if let Some(threads) = threads {
        threads.join(&capture).await;
    }

    Ok(Json(SessionResponse {
        session: Some(collector.snapshot()),
        capture: Some(capture.display().to_string()),
    }))
}

async fn handle_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let guard = state.session.lock().await;
    Json(match guard.as_ref() {
        Some(active) => active.response(),
        None => SessionResponse {
            session: None,
            capture: None,
        },
    })
}

async fn handle_sources() -> Json<SourcesResponse> {
    let sources: Vec<SourceEntry> = tokio::task::spawn_blocking(|| {
        SourceKind::ALL
            .iter()
            .filter_map(|&kind| {
                let mut src = SourceDescriptor::new(kind, SourceParams::default()).build().ok()?;
                let available = src.is_available();
                let info = src.info().clone();
                release_or_warn(src.as_mut());
                Some(SourceEntry {
                    id: info.id,
                    name: info.name,
                    description: info.description,
                    transport: info.transport.to_string(),
                    supports_fold: info.supports_fold,
                    available,
                })
            })
            .collect()
    })
    .await
    .unwrap_or_default();
    let total = sources.len();
    Json(SourcesResponse { sources, total })
}

async fn handle_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "rngcollect server",
        "version": rngcollect_core::VERSION,
        "sources": SourceKind::ALL.iter().map(|k| k.code()).collect::<Vec<_>>(),
        "endpoints": {
            "/": "This API index",
            "/sources": "Sources with availability",
            "/session": "Snapshot of the current session",
            "/session/start": {
                "method": "POST",
                "body": {
                    "source": "bitb | trng | intel | pseudo",
                    "sample_size_bits": "positive multiple of 8 (default: 2048)",
                    "frequency_secs": "seconds between samples (default: 1)",
                    "duration_secs": "session length, 0 = until stopped (default: 60)",
                    "fold": "XOR-fold level 0-4, bitb only (default: 0)",
                    "device": "explicit device path (optional)",
                    "note": "stored in session metadata (optional)",
                }
            },
            "/session/pause": "POST: pause sampling",
            "/session/resume": "POST: resume sampling",
            "/session/stop": "POST: stop and finish the capture",
        }
    }))
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/sources", get(handle_sources))
        .route("/session", get(handle_session))
        .route("/session/start", post(handle_start))
        .route("/session/pause", post(handle_pause))
        .route("/session/resume", post(handle_resume))
        .route("/session/stop", post(handle_stop))
        .with_state(state)
}

/// Run the HTTP control server until the process exits.
pub async fn run_server(host: &str, port: u16, output_dir: PathBuf) -> std::io::Result<()> {
    let app = build_router(AppState::new(output_dir));
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rngcollect_core::SessionStatus;

    fn params(source: &str) -> StartParams {
        StartParams {
            source: source.to_string(),
            sample_size_bits: Some(64),
            frequency_secs: Some(0.02),
            duration_secs: Some(0.0),
            fold: None,
            device: None,
            note: None,
        }
    }

    fn status_of(resp: &SessionResponse) -> SessionStatus {
        resp.session.as_ref().map(|s| s.status).unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(tmp.path().to_path_buf());

        let Json(started) = handle_start(State(state.clone()), Json(params("pseudo"))).await.unwrap();
        assert_eq!(status_of(&started), SessionStatus::Running);

        let err = handle_start(State(state.clone()), Json(params("pseudo"))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let Json(paused) = handle_pause(State(state.clone())).await.unwrap();
        assert_eq!(status_of(&paused), SessionStatus::Paused);
        let err = handle_pause(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(resumed) = handle_resume(State(state.clone())).await.unwrap();
        assert_eq!(status_of(&resumed), SessionStatus::Running);

        let Json(stopped) = handle_stop(State(state.clone())).await.unwrap();
        assert_eq!(status_of(&stopped), SessionStatus::Stopped);
        let capture = PathBuf::from(stopped.capture.unwrap());
        let samples = rngcollect_core::session::read_samples(&capture).unwrap();
        assert_eq!(samples.len() as u64, stopped.session.unwrap().sample_count);
        assert!(rngcollect_core::session::meta_path(&capture).exists());

        let err = handle_stop(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_control_without_session() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(tmp.path().to_path_buf());
        assert_eq!(handle_pause(State(state.clone())).await.unwrap_err().0, StatusCode::CONFLICT);
        assert_eq!(handle_resume(State(state.clone())).await.unwrap_err().0, StatusCode::CONFLICT);
        let Json(snap) = handle_session(State(state)).await;
        assert!(snap.session.is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_parameters() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(tmp.path().to_path_buf());

        let err = handle_start(State(state.clone()), Json(params("nope"))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let mut p = params("pseudo");
        p.sample_size_bits = Some(12);
        assert_eq!(handle_start(State(state.clone()), Json(p)).await.unwrap_err().0, StatusCode::BAD_REQUEST);

        let mut p = params("pseudo");
        p.frequency_secs = Some(-1.0);
        assert_eq!(handle_start(State(state.clone()), Json(p)).await.unwrap_err().0, StatusCode::BAD_REQUEST);

        let mut p = params("pseudo");
        p.fold = Some(2);
        assert_eq!(handle_start(State(state.clone()), Json(p)).await.unwrap_err().0, StatusCode::BAD_REQUEST);

        let mut p = params("bitb");
        p.device = Some(tmp.path().join("missing-device"));
        assert_eq!(
            handle_start(State(state.clone()), Json(p)).await.unwrap_err().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_on_hung_device_keeps_status_responsive() {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::fs::OpenOptionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let fifo = tmp.path().join("bitbabbler0");
        let c_path = CString::new(fifo.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let state = AppState::new(tmp.path().join("captures"));
        let mut p = params("bitb");
        p.device = Some(fifo.clone());
        p.frequency_secs = Some(1.0);
        handle_start(State(state.clone()), Json(p)).await.unwrap();
        // The read worker is now blocked opening the FIFO.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopping = tokio::spawn(handle_stop(State(state.clone())));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Json(snap) = tokio::time::timeout(Duration::from_millis(500), handle_session(State(state.clone())))
            .await
            .unwrap();
        assert_eq!(status_of(&snap), SessionStatus::Stopped);

        let Json(stopped) = stopping.await.unwrap().unwrap();
        assert_eq!(status_of(&stopped), SessionStatus::Stopped);
        assert_eq!(stopped.session.unwrap().sample_count, 0);

        // Let the detached worker finish its open.
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo);
    }

    #[tokio::test]
    async fn test_restart_in_same_second_gets_new_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(tmp.path().to_path_buf());

        let Json(first) = handle_start(State(state.clone()), Json(params("pseudo"))).await.unwrap();
        handle_stop(State(state.clone())).await.unwrap();
        let Json(second) = handle_start(State(state.clone()), Json(params("pseudo"))).await.unwrap();
        assert_eq!(status_of(&second), SessionStatus::Running);
        assert_ne!(first.capture, second.capture);
        handle_stop(State(state.clone())).await.unwrap();
    }

    #[tokio::test]
    async fn test_sources_lists_all_variants() {
        let Json(resp) = handle_sources().await;
        assert_eq!(resp.total, 4);
        assert!(resp.sources.iter().any(|s| s.id == "pseudo" && s.available));
    }
}
