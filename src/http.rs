use crate::broadcast::Broadcaster;
use crate::config::{HttpConfig, QuickCommand};
use crate::metrics::Metrics;
use crate::protocol::{PlayerList, StatusData};
use crate::registry::PrivilegeClass;
use crate::state::StatusSnapshot;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_LOG_LINES: usize = 1000;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub broadcaster: Arc<Broadcaster>,
    pub probe_on_read: bool,
}

impl HttpAppState {
    async fn snapshot(&self) -> Arc<StatusSnapshot> {
        if self.probe_on_read {
            self.broadcaster.refresh().await
        } else {
            self.broadcaster.cache().read().await
        }
    }
}

pub fn build_router(metrics: Arc<Metrics>, broadcaster: Arc<Broadcaster>, cfg: &HttpConfig) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/players", get(players_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/commands/quick", get(quick_commands_handler))
        .route("/ws", get(ws_handler))
        .route("/ws/*rest", get(ws_handler))
        .with_state(HttpAppState {
            metrics,
            broadcaster,
            probe_on_read: cfg.probe_on_read,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn status_handler(State(state): State<HttpAppState>) -> Json<StatusData> {
    let snapshot = state.snapshot().await;
    Json(StatusData::from(&*snapshot))
}

async fn players_handler(State(state): State<HttpAppState>) -> Json<PlayerList> {
    let snapshot = state.snapshot().await;
    Json(PlayerList::from(&*snapshot))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsBody {
    logs: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Debug, Serialize)]
struct QuickCommandsBody<'a> {
    commands: &'a [QuickCommand],
}

async fn logs_handler(State(state): State<HttpAppState>, Query(query): Query<LogsQuery>) -> Response {
    let controller = state.broadcaster.controller();
    let lines = query
        .lines
        .unwrap_or_else(|| controller.default_log_lines())
        .clamp(1, MAX_LOG_LINES);
    match controller.logs(lines).await {
        Ok(logs) => Json(LogsBody { logs }).into_response(),
        Err(err) => {
            warn!(error = %err, lines, "log tail failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "Failed to get logs",
                }),
            )
                .into_response()
        }
    }
}

async fn quick_commands_handler(State(state): State<HttpAppState>) -> Response {
    let commands = state.broadcaster.controller().quick_commands();
    Json(QuickCommandsBody { commands }).into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(state): State<HttpAppState>,
) -> Response {
    let marker = &state.broadcaster.config().privileged_path_marker;
    let class = PrivilegeClass::from_path(uri.path(), marker);
    ws.on_upgrade(move |socket| handle_socket(socket, state, class))
}

async fn handle_socket(mut socket: WebSocket, state: HttpAppState, class: PrivilegeClass) {
    let broadcaster = state.broadcaster;
    let (subscriber, mut outbound) = broadcaster.connect(class).await;
    let id = subscriber.id();
    subscriber.mark_open();
    broadcaster.greet(&subscriber).await;
    // registry now holds the only sender
    drop(subscriber);

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        debug!(subscriber_id = %id, error = %err, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let broadcaster = broadcaster.clone();
                    tokio::spawn(async move {
                        broadcaster.on_subscriber_message(id, &text).await;
                    });
                }
                Some(Ok(Message::Binary(_))) => state.metrics.inc_inbound_ignored(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(subscriber_id = %id, error = %err, "websocket receive failed");
                    break;
                }
            },
        }
    }

    broadcaster.disconnect(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::aggregator::ProbeAggregator;
    use crate::collectors::scripted::ScriptedHost;
    use crate::config::{BroadcastConfig, ControlConfig, ProbeConfig};
    use axum::body::to_bytes;
    use axum::http::Request;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const LOG: &str = "Player connected: Steve, xuid: 1\nPlayer connected: Alex, xuid: 2\n";

    fn parts(host: Arc<ScriptedHost>, probe_on_read: bool) -> (Router, Arc<Broadcaster>) {
        let metrics = Metrics::new().expect("инициализация метрик");
        let aggregator = ProbeAggregator::new(host, ProbeConfig::default(), 10, metrics.clone())
            .expect("агрегатор");
        let broadcaster = Broadcaster::new(
            aggregator,
            BroadcastConfig::default(),
            ControlConfig::default(),
            metrics.clone(),
        );
        let router = build_router(metrics, broadcaster.clone(), &HttpConfig { probe_on_read });
        (router, broadcaster)
    }

    fn app(host: Arc<ScriptedHost>, probe_on_read: bool) -> Router {
        parts(host, probe_on_read).0
    }

    async fn next_frame(client: &mut Client) -> WsMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("кадр не пришёл вовремя")
                .expect("соединение закрыто")
                .expect("ошибка websocket");
            if !matches!(frame, WsMessage::Ping(_) | WsMessage::Pong(_)) {
                return frame;
            }
        }
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        match next_frame(client).await {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("ожидался текстовый кадр, получен {other:?}"),
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (status, body) = get_body(app(ScriptedHost::up(LOG), true), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (status, body) = get_body(app(ScriptedHost::up(LOG), true), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("pulse_uptime_seconds"));
        assert!(body.contains("pulse_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_status_probes_on_read() {
        let host = ScriptedHost::up(LOG);
        let (status, body) = get_body(app(host.clone(), true), "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(host.cycles(), 1);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["reachable"], true);
        assert_eq!(value["occupantCount"], 2);
        assert_eq!(value["occupants"], serde_json::json!(["Steve", "Alex"]));
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn api_status_serves_cache_when_probing_is_disabled() {
        let host = ScriptedHost::up(LOG);
        let (status, body) = get_body(app(host.clone(), false), "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(host.cycles(), 0);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["reachable"], false);
        assert_eq!(value["occupantCount"], 0);
        assert_eq!(value["capacity"], 10);
    }

    #[tokio::test]
    async fn api_players_lists_occupants() {
        let (status, body) = get_body(app(ScriptedHost::up(LOG), true), "/api/players").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["online"], 2);
        assert_eq!(value["max"], 10);
        assert_eq!(value["list"], serde_json::json!(["Steve", "Alex"]));
    }

    #[tokio::test]
    async fn websocket_route_requires_upgrade() {
        let (status, _) = get_body(app(ScriptedHost::up(LOG), true), "/ws/admin").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn api_logs_returns_the_requested_tail() {
        let host = ScriptedHost::up(LOG);
        let (status, body) = get_body(app(host.clone(), false), "/api/logs?lines=1").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["logs"], "Player connected: Alex, xuid: 2");
        assert_eq!(host.log_reads(), 1);
    }

    #[tokio::test]
    async fn api_logs_defaults_and_clamps_line_count() {
        let (status, body) = get_body(app(ScriptedHost::up(LOG), false), "/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["logs"].as_str().unwrap().lines().count(), 2);

        let (status, body) = get_body(app(ScriptedHost::up(LOG), false), "/api/logs?lines=0").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["logs"], "Player connected: Alex, xuid: 2");
    }

    #[tokio::test]
    async fn api_logs_reports_console_failure() {
        let host = ScriptedHost::up(LOG);
        host.set(|s| s.log = None);
        let (status, body) = get_body(app(host, false), "/api/logs").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"], "Failed to get logs");
    }

    #[tokio::test]
    async fn api_quick_commands_lists_the_catalogue() {
        let (status, body) =
            get_body(app(ScriptedHost::up(LOG), false), "/api/commands/quick").await;

        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        let commands = value["commands"].as_array().unwrap();
        assert_eq!(commands.len(), ControlConfig::default().quick_commands.len());
        assert_eq!(commands[0]["name"], "Clear weather");
        assert!(commands[0]["command"].as_str().is_some());
    }

    #[tokio::test]
    async fn websocket_clients_get_greeted_refreshed_and_closed() {
        let (router, broadcaster) = parts(ScriptedHost::up(LOG), false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (mut user, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut admin, _) = connect_async(format!("ws://{addr}/ws/admin")).await.unwrap();

        for client in [&mut user, &mut admin] {
            let connected = next_json(client).await;
            assert_eq!(connected["type"], "connected");
            let status = next_json(client).await;
            assert_eq!(status["type"], "status_update");
            assert_eq!(status["data"]["occupantCount"], 2);
        }

        user.send(WsMessage::Text(r#"{"type":"request_status"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut user).await["type"], "status_update");
        assert_eq!(next_json(&mut admin).await["type"], "status_update");

        assert_eq!(broadcaster.broadcast_privileged("tail".to_string()).await, 1);
        let logs = next_json(&mut admin).await;
        assert_eq!(logs["type"], "logs");
        assert_eq!(logs["data"], "tail");

        broadcaster.shutdown().await;
        assert!(matches!(next_frame(&mut user).await, WsMessage::Close(_)));
        assert!(matches!(next_frame(&mut admin).await, WsMessage::Close(_)));
    }
}
