//! `/api/system` - version, host command execution (buffered and SSE),
//! and security ban management.

use super::ActionResponse;
use crate::error::ApiResult;
use crate::security::BannedIp;
use crate::state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use edge_exec::{ExecEvent, ExecuteResult, DEFAULT_TIMEOUT_SECS};
use edge_types::Shell;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/version", get(version))
        .route("/execute", post(execute))
        .route("/execute-stream", post(execute_stream))
        .route("/optimize", post(optimize))
        .route("/optimize/status", get(optimize_status))
        .route("/banned-ips", get(banned_ips))
        .route("/unban", post(unban))
}

/// Network sysctls applied by the optimizer: BBR with fq pacing and
/// buffers sized for long-haul TCP relaying.
const OPTIMIZE_SYSCTLS: &[(&str, &str)] = &[
    ("net.core.default_qdisc", "fq"),
    ("net.ipv4.tcp_congestion_control", "bbr"),
    ("net.core.somaxconn", "65535"),
    ("net.ipv4.tcp_fastopen", "3"),
    ("net.ipv4.tcp_mtu_probing", "1"),
    ("net.core.rmem_max", "67108864"),
    ("net.core.wmem_max", "67108864"),
    ("net.ipv4.tcp_rmem", "4096 87380 67108864"),
    ("net.ipv4.tcp_wmem", "4096 65536 67108864"),
];

const SYSCTL_CONF_PATH: &str = "/etc/sysctl.d/99-edgewatch-net.conf";

#[derive(Serialize)]
struct OptimizeItem {
    setting: String,
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct OptimizeResponse {
    success: bool,
    applied: usize,
    failed: usize,
    persisted: bool,
    results: Vec<OptimizeItem>,
}

async fn optimize(State(state): State<AppState>) -> Json<OptimizeResponse> {
    let mut results = Vec::with_capacity(OPTIMIZE_SYSCTLS.len());
    let mut applied = 0;
    let mut failed = 0;

    for (key, value) in OPTIMIZE_SYSCTLS {
        let result = state
            .executor
            .execute(&format!("sysctl -w {}=\"{}\"", key, value), 10, Shell::Sh)
            .await;
        if result.success {
            applied += 1;
        } else {
            failed += 1;
        }
        results.push(OptimizeItem {
            setting: format!("{}={}", key, value),
            success: result.success,
            message: if result.success {
                result.stdout
            } else {
                result.error.unwrap_or(result.stderr)
            },
        });
    }

    // Persist the applied values so a reboot keeps them.
    let conf: String = OPTIMIZE_SYSCTLS
        .iter()
        .map(|(key, value)| format!("{} = {}\n", key, value))
        .collect();
    let persist = state
        .executor
        .execute(
            &format!("printf '%s' '{}' > {}", conf.replace('\'', ""), SYSCTL_CONF_PATH),
            10,
            Shell::Sh,
        )
        .await;

    Json(OptimizeResponse {
        success: failed == 0,
        applied,
        failed,
        persisted: persist.success,
        results,
    })
}

#[derive(Serialize)]
struct OptimizeStatus {
    congestion_control: String,
    default_qdisc: String,
    conf_present: bool,
}

async fn optimize_status(State(state): State<AppState>) -> Json<OptimizeStatus> {
    let cc = state
        .executor
        .execute("sysctl -n net.ipv4.tcp_congestion_control", 10, Shell::Sh)
        .await;
    let qdisc = state
        .executor
        .execute("sysctl -n net.core.default_qdisc", 10, Shell::Sh)
        .await;
    let conf = state
        .executor
        .execute(&format!("test -f {}", SYSCTL_CONF_PATH), 10, Shell::Sh)
        .await;

    Json(OptimizeStatus {
        congestion_control: cc.stdout,
        default_qdisc: qdisc.stdout,
        conf_present: conf.success,
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    name: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        name: "edgewatch-node",
    })
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    shell: Shell,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Json<ExecuteResult> {
    Json(
        state
            .executor
            .execute(&request.command, request.timeout, request.shell)
            .await,
    )
}

fn to_sse_event(event: ExecEvent) -> Event {
    match event {
        ExecEvent::Stdout { line } => Event::default()
            .event("stdout")
            .data(json!({ "line": line }).to_string()),
        ExecEvent::Stderr { line } => Event::default()
            .event("stderr")
            .data(json!({ "line": line }).to_string()),
        ExecEvent::Error { message } => Event::default()
            .event("error")
            .data(json!({ "message": message }).to_string()),
        ExecEvent::Done {
            exit_code,
            execution_time_ms,
            success,
        } => Event::default().event("done").data(
            json!({
                "exit_code": exit_code,
                "execution_time_ms": execution_time_ms,
                "success": success,
            })
            .to_string(),
        ),
    }
}

async fn execute_stream(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .executor
        .execute_stream(&request.command, request.timeout, request.shell)
        .map(|event| Ok(to_sse_event(event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
struct BannedIpsResponse {
    banned: Vec<BannedIp>,
    count: usize,
}

async fn banned_ips(State(state): State<AppState>) -> Json<BannedIpsResponse> {
    let banned = state.security.banned_ips();
    Json(BannedIpsResponse {
        count: banned.len(),
        banned,
    })
}

#[derive(Deserialize)]
struct UnbanRequest {
    ip: String,
}

async fn unban(
    State(state): State<AppState>,
    Json(request): Json<UnbanRequest>,
) -> ApiResult<Json<ActionResponse>> {
    if state.security.unban(&request.ip) {
        Ok(Json(ActionResponse::ok(format!("IP {} unbanned", request.ip))))
    } else {
        Ok(Json(ActionResponse {
            success: false,
            message: format!("IP {} was not tracked", request.ip),
        }))
    }
}
