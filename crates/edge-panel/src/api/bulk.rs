//! `/api/bulk` - apply one node action to many servers in parallel,
//! reporting a per-server outcome list.

use super::{ApiResult, PanelState};
use crate::store::servers::{self, Server};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use edge_types::{Direction, FirewallAction, Protocol, RuleKind};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const BULK_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router() -> Router<PanelState> {
    Router::new()
        .route("/haproxy/rules", post(create_haproxy_rules))
        .route("/haproxy/rules/delete", post(delete_haproxy_rules))
        .route("/traffic/ports", post(add_traffic_ports))
        .route("/traffic/ports/delete", post(remove_traffic_ports))
        .route("/firewall/rules", post(create_firewall_rules))
        .route("/firewall/rules/delete", post(delete_firewall_rules))
}

#[derive(Debug, Serialize)]
pub struct BulkResult {
    pub server_id: i64,
    pub server_name: String,
    pub success: bool,
    pub message: String,
}

async fn servers_by_ids(state: &PanelState, ids: &[i64]) -> ApiResult<Vec<Server>> {
    let mut result = Vec::new();
    for id in ids {
        if let Ok(server) = servers::get(&state.pool, *id).await {
            result.push(server);
        }
    }
    Ok(result)
}

/// Run one request against every listed server concurrently.
async fn fan_out(
    state: &PanelState,
    server_list: Vec<Server>,
    method: Method,
    path: String,
    body: Option<Value>,
) -> Vec<BulkResult> {
    let futures: Vec<_> = server_list
        .into_iter()
        .map(|server| {
            let client = state.node_client.clone();
            let method = method.clone();
            let path = path.clone();
            let body = body.clone();
            async move {
                match client
                    .forward(&server, method, &path, body, BULK_TIMEOUT)
                    .await
                {
                    Ok((status, value)) if status < 400 => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: true,
                        message: value
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("OK")
                            .to_string(),
                    },
                    Ok((status, value)) => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: false,
                        message: value
                            .get("detail")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("Error {}", status)),
                    },
                    Err(e) => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: false,
                        message: e.to_string(),
                    },
                }
            }
        })
        .collect();

    futures::future::join_all(futures).await
}

#[derive(Deserialize)]
struct BulkHaproxyRuleCreate {
    server_ids: Vec<i64>,
    name: String,
    #[serde(default = "default_tcp_kind")]
    rule_type: RuleKind,
    listen_port: u16,
    target_ip: String,
    target_port: u16,
    #[serde(default)]
    cert_domain: Option<String>,
    #[serde(default)]
    target_ssl: bool,
    #[serde(default)]
    send_proxy: bool,
}

fn default_tcp_kind() -> RuleKind {
    RuleKind::Tcp
}

async fn create_haproxy_rules(
    State(state): State<PanelState>,
    Json(request): Json<BulkHaproxyRuleCreate>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;
    let body = json!({
        "name": request.name,
        "rule_type": request.rule_type,
        "listen_port": request.listen_port,
        "target_ip": request.target_ip,
        "target_port": request.target_port,
        "cert_domain": request.cert_domain,
        "target_ssl": request.target_ssl,
        "send_proxy": request.send_proxy,
    });
    Ok(Json(
        fan_out(
            &state,
            server_list,
            Method::POST,
            "/api/haproxy/rules".into(),
            Some(body),
        )
        .await,
    ))
}

#[derive(Deserialize)]
struct BulkHaproxyRuleDelete {
    server_ids: Vec<i64>,
    listen_port: u16,
    target_ip: String,
    target_port: u16,
}

/// Delete by shape rather than name: each node is asked for its rules
/// and the one matching listen/target is removed.
async fn delete_haproxy_rules(
    State(state): State<PanelState>,
    Json(request): Json<BulkHaproxyRuleDelete>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;

    let futures: Vec<_> = server_list
        .into_iter()
        .map(|server| {
            let client = state.node_client.clone();
            let listen_port = request.listen_port;
            let target_ip = request.target_ip.clone();
            let target_port = request.target_port;
            async move {
                let rules = client
                    .forward(&server, Method::GET, "/api/haproxy/rules", None, BULK_TIMEOUT)
                    .await;

                let name = match rules {
                    Ok((200, value)) => value
                        .get("rules")
                        .and_then(Value::as_array)
                        .and_then(|rules| {
                            rules.iter().find(|rule| {
                                rule.get("listen_port").and_then(Value::as_u64)
                                    == Some(listen_port as u64)
                                    && rule.get("target_ip").and_then(Value::as_str)
                                        == Some(target_ip.as_str())
                                    && rule.get("target_port").and_then(Value::as_u64)
                                        == Some(target_port as u64)
                            })
                        })
                        .and_then(|rule| rule.get("name").and_then(Value::as_str))
                        .map(str::to_string),
                    _ => None,
                };

                let Some(name) = name else {
                    return BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: false,
                        message: "No matching rule found".into(),
                    };
                };

                match client
                    .forward(
                        &server,
                        Method::DELETE,
                        &format!("/api/haproxy/rules/{}", name),
                        None,
                        BULK_TIMEOUT,
                    )
                    .await
                {
                    Ok((status, _)) if status < 400 => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: true,
                        message: format!("Rule '{}' deleted", name),
                    },
                    Ok((status, _)) => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: false,
                        message: format!("Error {}", status),
                    },
                    Err(e) => BulkResult {
                        server_id: server.id,
                        server_name: server.name,
                        success: false,
                        message: e.to_string(),
                    },
                }
            }
        })
        .collect();

    Ok(Json(futures::future::join_all(futures).await))
}

#[derive(Deserialize)]
struct BulkTrafficPort {
    server_ids: Vec<i64>,
    port: u16,
}

async fn add_traffic_ports(
    State(state): State<PanelState>,
    Json(request): Json<BulkTrafficPort>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;
    Ok(Json(
        fan_out(
            &state,
            server_list,
            Method::POST,
            "/api/traffic/ports/tracked".into(),
            Some(json!({"port": request.port})),
        )
        .await,
    ))
}

async fn remove_traffic_ports(
    State(state): State<PanelState>,
    Json(request): Json<BulkTrafficPort>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;
    Ok(Json(
        fan_out(
            &state,
            server_list,
            Method::DELETE,
            format!("/api/traffic/ports/tracked/{}", request.port),
            None,
        )
        .await,
    ))
}

#[derive(Deserialize)]
struct BulkFirewallRuleCreate {
    server_ids: Vec<i64>,
    port: u16,
    #[serde(default = "default_any")]
    protocol: Protocol,
    #[serde(default = "default_allow")]
    action: FirewallAction,
    #[serde(default)]
    from_ip: Option<String>,
    #[serde(default = "default_in")]
    direction: Direction,
}

fn default_any() -> Protocol {
    Protocol::Any
}

fn default_allow() -> FirewallAction {
    FirewallAction::Allow
}

fn default_in() -> Direction {
    Direction::In
}

async fn create_firewall_rules(
    State(state): State<PanelState>,
    Json(request): Json<BulkFirewallRuleCreate>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;
    let body = json!({
        "port": request.port,
        "protocol": request.protocol,
        "action": request.action,
        "from_ip": request.from_ip,
        "direction": request.direction,
    });
    Ok(Json(
        fan_out(
            &state,
            server_list,
            Method::POST,
            "/api/haproxy/firewall/rules".into(),
            Some(body),
        )
        .await,
    ))
}

#[derive(Deserialize)]
struct BulkFirewallRuleDelete {
    server_ids: Vec<i64>,
    port: u16,
    #[serde(default = "default_any")]
    protocol: Protocol,
}

async fn delete_firewall_rules(
    State(state): State<PanelState>,
    Json(request): Json<BulkFirewallRuleDelete>,
) -> ApiResult<Json<Vec<BulkResult>>> {
    let server_list = servers_by_ids(&state, &request.server_ids).await?;
    Ok(Json(
        fan_out(
            &state,
            server_list,
            Method::POST,
            "/api/haproxy/firewall/remove-port".into(),
            Some(json!({"port": request.port, "protocol": request.protocol})),
        )
        .await,
    ))
}
