mod collaborators;
mod config;
mod input;
mod media_sender;
mod peer;
mod registry;
mod room;
mod rtp;
mod signaling;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::collaborators::{LoggingCaptureControl, RecordingInputSink, VideoCodec, VideoEncoderQueue};
use crate::media_sender::MediaSender;
use crate::peer::{IceServerConfig, build_api};
use crate::registry::PeerRegistry;
use crate::room::Room;
use crate::signaling::SignalingServer;

const VIDEO_SSRC: u32 = 0x5747_0001;
const AUDIO_SSRC: u32 = 0x5747_0002;

fn parse_args() -> (PathBuf, Option<u16>, bool) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/streamcore.toml");
    let mut port_override = None;
    let mut no_tls = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--no-tls" => no_tls = true,
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override, no_tls)
}

/// Adds the baseline hardening headers every response should carry. There is
/// no cookie-based session here, but the signaling WebSocket is still an
/// origin-sensitive surface worth defending with the usual set.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        header::HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    response
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<Arc<SignalingServer>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| signaling::handle_socket(server, socket))
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override, no_tls) = parse_args();

    let mut core_config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        core_config.server.port_base = p;
    }
    if no_tls {
        core_config.server.signaling_ssl = false;
    }

    if let Err(issues) = core_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!("configuration has {} issue(s); fix the ERROR(s) above and restart", issues.len());
            std::process::exit(1);
        }
    }

    let ws_port = core_config.server.ws_port();
    let bind_addr: SocketAddr = format!("{}:{}", core_config.server.bind, ws_port)
        .parse()
        .context("invalid bind address")?;

    let ice_servers: Vec<IceServerConfig> = {
        let mut servers = vec![IceServerConfig {
            urls: core_config.ice.stun_urls.clone(),
            username: None,
            credential: None,
        }];
        if let Some(turn_url) = core_config.ice.turn_url.clone() {
            servers.push(IceServerConfig {
                urls: vec![turn_url],
                username: core_config.ice.turn_username.clone(),
                credential: core_config.ice.turn_credential.clone(),
            });
        }
        servers
    };

    let room = Arc::new(Room::new(core_config.room.max_players));
    room.set_default_guest_keyboard(core_config.room.default_guest_keyboard);
    room.set_default_guest_mouse(core_config.room.default_guest_mouse);
    let registry = Arc::new(PeerRegistry::new());

    // No concrete encoder/capture/input backend is wired into this crate
    // (§6: VideoEncoderQueue/AudioEncoderQueue/InputSink/CaptureControl are
    // collaborator interfaces a deployment supplies). The logging/no-op
    // implementations here keep the signaling and media-fanout paths live
    // for local testing and as a reference wiring point.
    let video_queue = Arc::new(NullVideoQueue);
    let audio_queue = Arc::new(NullAudioQueue);
    let capture = Arc::new(LoggingCaptureControl::new());
    let input_sink = Arc::new(RecordingInputSink::new());

    let video_codec = video_queue.codec();
    let packetizer = Arc::new(rtp::RtpPacketizer::new(video_codec, VIDEO_SSRC, AUDIO_SSRC));
    let media_sender = Arc::new(MediaSender::new(
        registry.clone(),
        packetizer,
        video_queue,
        audio_queue,
        capture,
        Some(core_config.video.default_framerate),
    ));
    let input_router = Arc::new(input::InputRouter::new(room.clone(), input_sink));
    let api = Arc::new(build_api().map_err(|e| anyhow::anyhow!(e.to_string()))?);

    let signaling_server = Arc::new(SignalingServer::new(
        room,
        registry,
        media_sender,
        input_router,
        api,
        ice_servers,
        video_codec,
        (
            core_config.video.default_bitrate_kbps,
            core_config.video.default_framerate,
            core_config.video.default_width,
            core_config.video.default_height,
        ),
    ));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(signaling_server.clone())
        .layer(axum::middleware::from_fn(security_headers))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!("request", method = %request.method(), path = %request.uri().path(), request_id = %request_id)
                })
                .on_response(|response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, status = %response.status().as_u16(), duration_ms = %latency.as_millis(), "completed");
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  streamcore media core");
    tracing::info!("  listening on {bind_addr} (tls={})", core_config.server.signaling_ssl);
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    if core_config.server.signaling_ssl {
        let tls_result = tls::build_tls_config(
            core_config.server.tls_cert.as_deref(),
            core_config.server.tls_key.as_deref(),
        )?;
        let tls_acceptor = tls::make_acceptor(tls_result.config);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("failed to accept TCP connection: {e}");
                            continue;
                        }
                    };
                    let acceptor = tls_acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                            Ok(Ok(s)) => s,
                            Ok(Err(e)) => {
                                tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(%peer_addr, "TLS handshake timed out");
                                return;
                            }
                        };
                        let io = hyper_util::rt::TokioIo::new(tls_stream);
                        let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                        let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
                        if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                            tracing::debug!(%peer_addr, "connection error: {e}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    break;
                }
            }
        }
    } else {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("failed to accept TCP connection: {e}");
                            continue;
                        }
                    };
                    let app = app.clone();
                    tokio::spawn(async move {
                        let io = hyper_util::rt::TokioIo::new(stream);
                        let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                        let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
                        if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                            tracing::debug!(%peer_addr, "connection error: {e}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    break;
                }
            }
        }
    }

    tracing::info!("closing signaling to new peers");
    signaling_server.stop_accepting();
    signaling_server.close_all_for_shutdown().await;
    tracing::info!("streamcore server shut down cleanly");

    Ok(())
}

struct NullVideoQueue;

#[async_trait::async_trait]
impl collaborators::VideoEncoderQueue for NullVideoQueue {
    async fn recv(&self) -> Option<collaborators::EncoderFrame> {
        std::future::pending().await
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }
}

struct NullAudioQueue;

#[async_trait::async_trait]
impl collaborators::AudioEncoderQueue for NullAudioQueue {
    async fn recv(&self) -> Option<collaborators::EncoderFrame> {
        std::future::pending().await
    }
}
