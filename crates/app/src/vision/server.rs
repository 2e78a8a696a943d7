//! Actix Web endpoints controlling the live session and serving its frames.
//!
//! Handlers share one `LiveSession` through `web::Data`. Every MJPEG
//! connection runs its own publisher that polls the frame buffer until the
//! session's stop signal is observed.

use std::sync::Arc;

use actix_web::{
    App, HttpResponse, HttpServer,
    http::{Method, header},
    middleware::DefaultHeaders,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use futures_util::Stream;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use video_ingest::{DeviceOpener, Frame};

use crate::vision::{
    annotation::{Annotator, OverlayAnnotator},
    config::{CaptureBackend, LiveConfig},
    data::StatusResponse,
    encoding::{JpegCache, MJPEG_CONTENT_TYPE, multipart_part},
    error::LiveError,
    session::LiveSession,
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) session: LiveSession,
    pub(crate) jpeg_quality: u8,
    jpeg_cache: JpegCache,
}

impl ServerState {
    pub(crate) fn new(session: LiveSession, jpeg_quality: u8) -> Self {
        Self {
            session,
            jpeg_quality,
            jpeg_cache: JpegCache::new(),
        }
    }
}

/// Encode `frame` through the shared cache on the blocking pool.
async fn encode_shared(state: Arc<ServerState>, frame: Arc<Frame>) -> Result<Bytes, LiveError> {
    web::block(move || state.jpeg_cache.get_or_encode(&frame, state.jpeg_quality))
        .await
        .map_err(|err| LiveError::EncodingFailed(err.to_string()))?
}

/// Build the session from `config`, serve it until Ctrl-C, then release the device.
pub fn run(config: LiveConfig) -> Result<()> {
    let _telemetry = telemetry::init_tracing(&config.telemetry);
    telemetry::init_metrics_recorder();

    let opener = build_opener(&config);
    let annotator = build_annotator(&config)?;
    let state = web::Data::new(ServerState::new(
        LiveSession::new(opener, annotator, config.timing),
        config.jpeg_quality,
    ));

    let served = actix_web::rt::System::new().block_on(serve(&config, state.clone()));
    state.session.shutdown();
    served
}

async fn serve(config: &LiveConfig, state: web::Data<ServerState>) -> Result<()> {
    let app_state = state.clone();
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(cors_headers())
            .configure(routes)
    })
    .disable_signals();
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }
    let server = server
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?
        .run();
    info!(
        "live server listening on http://{}:{} ({:?} backend)",
        config.host, config.port, config.backend
    );

    let srv_handle = server.handle();
    actix_web::rt::spawn(async move {
        if let Err(err) = actix_web::rt::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {err}");
            return;
        }
        info!("shutdown requested");
        // Streams only end on the stop signal, so raise it before draining.
        state.session.stop();
        srv_handle.stop(true).await;
    });

    server.await.context("HTTP server error")
}

fn build_opener(config: &LiveConfig) -> Arc<dyn DeviceOpener> {
    match config.backend {
        #[cfg(feature = "with-opencv")]
        CaptureBackend::Opencv => Arc::new(video_ingest::OpenCvOpener::new((
            config.width,
            config.height,
        ))),
        #[cfg(not(feature = "with-opencv"))]
        CaptureBackend::Opencv => {
            warn!("OpenCV support not compiled in; using the test pattern");
            Arc::new(video_ingest::TestPatternOpener::new(
                config.width,
                config.height,
            ))
        }
        CaptureBackend::TestPattern => Arc::new(video_ingest::TestPatternOpener::new(
            config.width,
            config.height,
        )),
    }
}

#[cfg(feature = "with-tch")]
fn build_annotator(config: &LiveConfig) -> Result<Arc<dyn Annotator>> {
    use ml_core::{detector::Detector, tch::Device};

    let Some(model_path) = config.model_path.as_ref() else {
        return Ok(Arc::new(OverlayAnnotator::new()));
    };
    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = Detector::new(
        model_path,
        device,
        (
            i64::from(config.detector_width),
            i64::from(config.detector_height),
        ),
    )
    .with_context(|| format!("Failed to load detector from {}", model_path.display()))?;
    info!(
        "detector loaded on {:?} ({}x{} input)",
        detector.device(),
        config.detector_width,
        config.detector_height
    );
    Ok(Arc::new(crate::vision::annotation::DetectorAnnotator::new(
        detector,
    )))
}

#[cfg(not(feature = "with-tch"))]
fn build_annotator(_config: &LiveConfig) -> Result<Arc<dyn Annotator>> {
    Ok(Arc::new(OverlayAnnotator::new()))
}

/// Permissive CORS headers attached to every response.
pub(crate) fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/start_live")
            .route(web::post().to(start_live))
            .route(web::method(Method::OPTIONS).to(preflight)),
    )
    .service(
        web::resource("/stop_live")
            .route(web::post().to(stop_live))
            .route(web::method(Method::OPTIONS).to(preflight)),
    )
    .route("/video_feed", web::get().to(video_feed))
    .route("/status", web::get().to(status_handler))
    .route("/frame.jpg", web::get().to(frame_handler))
    .route("/metrics", web::get().to(metrics_handler));
}

async fn start_live(body: Bytes, state: web::Data<ServerState>) -> HttpResponse {
    let device = match requested_device(&body) {
        Ok(device) => device,
        Err(message) => {
            debug!("rejecting start request: {message}");
            return HttpResponse::BadRequest().json(json!({ "error": message }));
        }
    };

    match state.session.start(device) {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(err) => {
            error!("failed to start live session: {err:?}");
            HttpResponse::InternalServerError().json(json!({ "error": format!("{err:#}") }))
        }
    }
}

/// Device index named by a `/start_live` body.
///
/// An absent or unparsable body, or one without `device`, selects device 0.
fn requested_device(body: &[u8]) -> Result<i32, String> {
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
        return Ok(0);
    };
    match fields.get("device") {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|value| value.fract() == 0.0)
                    .map(|value| value as i64)
            })
            .and_then(|value| i32::try_from(value).ok())
            .ok_or_else(|| format!("device must be an integer, got {number}")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("device must be an integer, got {text:?}")),
        Some(other) => Err(format!("device must be an integer, got {other}")),
    }
}

async fn stop_live(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.session.stop())
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let session = &state.session;
    HttpResponse::Ok().json(StatusResponse {
        state: session.state(),
        device: session.device(),
        has_frame: !session.buffer().is_empty(),
        frames_published: session.frames_published(),
    })
}

/// Return the latest published frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    let Some(frame) = state.session.buffer().read() else {
        return HttpResponse::NoContent().finish();
    };
    match encode_shared(state.into_inner(), frame).await {
        Ok(jpeg) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        Err(err) => {
            metrics::counter!("live_encoding_failures_total").increment(1);
            error!("{err}");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}

/// Stream the live frame buffer as `multipart/x-mixed-replace`.
async fn video_feed(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .content_type(MJPEG_CONTENT_TYPE)
        .streaming(mjpeg_stream(state.into_inner()))
}

/// Tracks open stream connections, including ones the client drops.
struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        metrics::gauge!("live_stream_connections").increment(1.0);
        ConnectionGauge
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        metrics::gauge!("live_stream_connections").decrement(1.0);
    }
}

/// Per-connection publisher: one multipart part per tick until stop is signalled.
pub(crate) fn mjpeg_stream(
    state: Arc<ServerState>,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    let span = tracing::info_span!("live.stream");
    stream! {
        let _connection = ConnectionGauge::open();
        let timing = state.session.timing();
        let mut parts_sent: u64 = 0;
        debug!(parent: &span, "stream connected");

        while !state.session.stop_requested() {
            let Some(frame) = state.session.buffer().read() else {
                actix_web::rt::time::sleep(timing.idle_interval).await;
                continue;
            };
            match encode_shared(state.clone(), frame).await {
                Ok(jpeg) => {
                    parts_sent += 1;
                    yield Ok::<Bytes, actix_web::Error>(multipart_part(&jpeg));
                }
                Err(err) => {
                    metrics::counter!("live_encoding_failures_total").increment(1);
                    warn!(parent: &span, "{err}; skipping tick");
                }
            }
            actix_web::rt::time::sleep(timing.stream_interval).await;
        }

        debug!(parent: &span, parts_sent, "stream closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use actix_web::{
        http::StatusCode,
        test::{self, TestRequest},
    };
    use futures_util::StreamExt;

    use super::*;
    use crate::vision::{
        data::SessionState,
        encoding::encode_jpeg,
        testing::{
            InvertAnnotator, ScriptedOpener, inverted, session_with, solid_frame, wait_until,
        },
    };

    fn state_with(opener: ScriptedOpener) -> web::Data<ServerState> {
        web::Data::new(ServerState::new(
            session_with(opener, InvertAnnotator),
            85,
        ))
    }

    macro_rules! live_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .wrap(cors_headers())
                    .configure(routes),
            )
            .await
        };
    }

    #[test]
    fn device_defaults_to_zero_for_missing_or_unparsable_bodies() {
        assert_eq!(requested_device(b""), Ok(0));
        assert_eq!(requested_device(b"not json"), Ok(0));
        assert_eq!(requested_device(b"[1, 2]"), Ok(0));
        assert_eq!(requested_device(br#"{"other": 4}"#), Ok(0));
        assert_eq!(requested_device(br#"{"device": null}"#), Ok(0));
    }

    #[test]
    fn device_accepts_integers_and_numeric_strings() {
        assert_eq!(requested_device(br#"{"device": 2}"#), Ok(2));
        assert_eq!(requested_device(br#"{"device": " 3 "}"#), Ok(3));
        assert_eq!(requested_device(br#"{"device": 1.0}"#), Ok(1));
        assert!(requested_device(br#"{"device": "cam"}"#).is_err());
        assert!(requested_device(br#"{"device": 1.5}"#).is_err());
        assert!(requested_device(br#"{"device": true}"#).is_err());
        assert!(requested_device(br#"{"device": 99999999999}"#).is_err());
    }

    #[actix_web::test]
    async fn start_stop_and_status_over_http() {
        let state = state_with(ScriptedOpener::with_frames(vec![solid_frame(7)]));
        let app = live_app!(state);

        let req = TestRequest::post()
            .uri("/start_live")
            .set_json(json!({ "device": 0 }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "started", "device": 0 }));

        let req = TestRequest::post()
            .uri("/start_live")
            .set_json(json!({ "device": "4" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "already_running", "device": 0 }));

        assert!(wait_until(|| state.session.frames_published() == 1));
        let req = TestRequest::get().uri("/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "running");
        assert_eq!(body["device"], 0);
        assert_eq!(body["has_frame"], true);
        assert_eq!(body["frames_published"], 1);

        let req = TestRequest::post().uri("/stop_live").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "stop_requested" }));

        assert!(wait_until(|| state.session.state() == SessionState::Idle));
        let req = TestRequest::get().uri("/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["device"], Value::Null);
        assert_eq!(body["has_frame"], false);
    }

    #[actix_web::test]
    async fn start_without_body_uses_device_zero() {
        let state = state_with(ScriptedOpener::with_frames(Vec::new()));
        let app = live_app!(state);

        let req = TestRequest::post().uri("/start_live").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "started", "device": 0 }));
    }

    #[actix_web::test]
    async fn start_rejects_non_integer_device() {
        let state = state_with(ScriptedOpener::with_frames(Vec::new()));
        let app = live_app!(state);

        let req = TestRequest::post()
            .uri("/start_live")
            .set_json(json!({ "device": "front" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().is_some());
        assert_eq!(state.session.state(), SessionState::Idle);
    }

    #[actix_web::test]
    async fn frame_endpoint_is_empty_until_a_frame_is_published() {
        let state = state_with(ScriptedOpener::with_frames(vec![solid_frame(9)]));
        let app = live_app!(state);

        let req = TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        state.session.start(0).unwrap();
        assert!(wait_until(|| state.session.frames_published() == 1));
        let req = TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let body = test::read_body(resp).await;
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }

    #[actix_web::test]
    async fn preflight_carries_cors_headers() {
        let state = state_with(ScriptedOpener::with_frames(Vec::new()));
        let app = live_app!(state);

        let req = TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/start_live")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[actix_web::test]
    async fn video_feed_sets_multipart_headers_and_closes_on_stop() {
        let state = state_with(ScriptedOpener::with_frames(Vec::new()));
        let app = live_app!(state);
        state.session.stop();

        let req = TestRequest::get().uri("/video_feed").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            MJPEG_CONTENT_TYPE
        );
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let body = test::read_body(resp).await;
        assert!(body.is_empty());
    }

    #[actix_web::test]
    async fn stream_after_failed_open_emits_nothing_and_ends_on_stop() {
        let state = state_with(ScriptedOpener::failing());
        state.session.start(0).unwrap();
        assert!(wait_until(|| state.session.state() == SessionState::Idle));

        let mut stream = Box::pin(mjpeg_stream(state.clone().into_inner()));
        let consumer = actix_web::rt::spawn(async move {
            let mut parts = 0usize;
            while let Some(part) = stream.next().await {
                part.unwrap();
                parts += 1;
            }
            parts
        });

        actix_web::rt::time::sleep(Duration::from_millis(40)).await;
        assert!(!consumer.is_finished());
        state.session.stop();

        let parts = actix_web::rt::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("stream ended after stop")
            .unwrap();
        assert_eq!(parts, 0);
    }

    #[actix_web::test]
    async fn concurrent_streams_receive_identical_parts() {
        let raw = solid_frame(200);
        let state = state_with(ScriptedOpener::with_frames(vec![raw.clone()]));
        state.session.start(0).unwrap();
        assert!(wait_until(|| state.session.frames_published() == 1));

        let mut first = Box::pin(mjpeg_stream(state.clone().into_inner()));
        let mut second = Box::pin(mjpeg_stream(state.clone().into_inner()));
        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_eq!(a, b);

        let expected = multipart_part(&encode_jpeg(&inverted(&raw), 85).unwrap());
        assert_eq!(a, expected);
        assert!(a.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));

        state.session.stop();
        assert!(first.next().await.is_none());
        assert!(second.next().await.is_none());
    }

    #[actix_web::test]
    async fn metrics_endpoint_renders_once_recorder_is_installed() {
        telemetry::init_metrics_recorder();
        let state = state_with(ScriptedOpener::with_frames(Vec::new()));
        let app = live_app!(state);

        let req = TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[cfg(not(feature = "with-opencv"))]
    #[test]
    fn opencv_backend_falls_back_to_the_test_pattern() {
        use clap::Parser;
        use video_ingest::CaptureDevice;

        let argv = ["live-vision", "--backend", "opencv", "--width", "16", "--height", "8"];
        let cli = crate::cli::Cli::try_parse_from(argv).unwrap();
        let config = LiveConfig::try_from(cli.server).unwrap();
        assert_eq!(config.backend, CaptureBackend::Opencv);

        let mut device = build_opener(&config).open(0).unwrap();
        let frame = device.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert!(frame.is_well_formed());
    }

    #[actix_web::test]
    async fn frame_endpoint_serves_the_cached_encode() {
        let raw = solid_frame(120);
        let state = state_with(ScriptedOpener::with_frames(vec![raw.clone()]));
        state.session.start(0).unwrap();
        assert!(wait_until(|| state.session.frames_published() == 1));
        let app = live_app!(state);

        let mut feed = Box::pin(mjpeg_stream(state.clone().into_inner()));
        let part = feed.next().await.unwrap().unwrap();

        let published = state.session.buffer().read().unwrap();
        let cached = state.jpeg_cache.get_or_encode(&published, 85).unwrap();
        assert_eq!(part, multipart_part(&cached));

        let req = TestRequest::get().uri("/frame.jpg").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, cached);
    }
}
