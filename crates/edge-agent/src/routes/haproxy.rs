//! `/api/haproxy` - service control, routing rules, certificates and
//! the UFW sub-surface.

use super::ActionResponse;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use edge_haproxy::{
    CertInfo, CertOutcome, CronStatus, HaproxyRule, RenewAllOutcome, RuleUpdate, ServiceStatus,
};
use edge_network::{FirewallRule, FirewallStatus};
use edge_types::{CertMethod, Direction, FirewallAction, Protocol, RuleKind};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/:name",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/reload", post(reload))
        .route("/restart", post(restart))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/validate", post(validate))
        .route("/config", get(get_config))
        .route("/config/apply", post(apply_config))
        .route("/certs", get(list_certs))
        .route("/certs/all", get(all_certs))
        .route("/certs/generate", post(generate_cert))
        .route("/certs/renew", post(renew_all_certs))
        .route("/certs/update-combined", post(update_combined))
        .route("/certs/upload", post(upload_cert))
        .route(
            "/certs/:domain",
            get(cert_info).delete(delete_cert),
        )
        .route("/certs/:domain/renew", post(renew_cert))
        .route("/cron/status", get(cron_status))
        .route("/cron/setup", post(cron_setup))
        .route("/cron/remove", delete(cron_remove))
        .route("/firewall/rules", get(firewall_rules).post(firewall_add))
        .route("/firewall/rules/:number", delete(firewall_delete_number))
        .route("/firewall/remove-port", post(firewall_remove_port))
        .route("/firewall/status", get(firewall_status))
        .route("/firewall/enable", post(firewall_enable))
        .route("/firewall/disable", post(firewall_disable))
        .route("/firewall/reset", post(firewall_reset))
}

// ── service ──

async fn status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(state.haproxy.status().await)
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

#[derive(Serialize)]
struct LogsResponse {
    logs: String,
}

async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    Json(LogsResponse {
        logs: state.haproxy.get_logs(query.tail).await,
    })
}

async fn reload(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.reload(true).await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn restart(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.restart().await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn start(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.start().await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn stop(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.stop().await?;
    Ok(Json(ActionResponse::ok(message)))
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    message: String,
}

async fn validate(State(state): State<AppState>) -> Json<ValidateResponse> {
    match state.haproxy.check_config().await {
        Ok(message) => Json(ValidateResponse {
            valid: true,
            message,
        }),
        Err(e) => Json(ValidateResponse {
            valid: false,
            message: e.to_string(),
        }),
    }
}

#[derive(Serialize)]
struct ConfigResponse {
    content: String,
    path: String,
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        content: state.haproxy.get_config(),
        path: state.haproxy.config_path().display().to_string(),
    })
}

#[derive(Deserialize)]
struct ApplyConfigRequest {
    content: String,
    #[serde(default = "default_true")]
    reload: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct ApplyConfigResponse {
    success: bool,
    message: String,
    reloaded: bool,
}

async fn apply_config(
    State(state): State<AppState>,
    Json(request): Json<ApplyConfigRequest>,
) -> ApiResult<Json<ApplyConfigResponse>> {
    let outcome = state
        .haproxy
        .apply_config(&request.content, request.reload)
        .await?;
    Ok(Json(ApplyConfigResponse {
        success: true,
        message: outcome.message,
        reloaded: outcome.reloaded,
    }))
}

// ── rules ──

#[derive(Serialize)]
struct RulesListResponse {
    rules: Vec<HaproxyRule>,
    count: usize,
}

async fn list_rules(State(state): State<AppState>) -> Json<RulesListResponse> {
    let rules = state.haproxy.parse_rules();
    Json(RulesListResponse {
        count: rules.len(),
        rules,
    })
}

async fn get_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<HaproxyRule>> {
    state
        .haproxy
        .get_rule(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Rule '{}' not found", name)))
}

#[derive(Deserialize)]
struct RuleCreateRequest {
    name: String,
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

async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<RuleCreateRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .haproxy
        .add_rule(HaproxyRule {
            name: request.name,
            rule_type: request.rule_type,
            listen_port: request.listen_port,
            target_ip: request.target_ip,
            target_port: request.target_port,
            cert_domain: request.cert_domain,
            target_ssl: request.target_ssl,
            send_proxy: request.send_proxy,
        })
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(updates): Json<RuleUpdate>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.update_rule(&name, updates).await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.delete_rule(&name).await?;
    Ok(Json(ActionResponse::ok(message)))
}

// ── certificates ──

#[derive(Serialize)]
struct CertsResponse {
    certificates: Vec<String>,
}

async fn list_certs(State(state): State<AppState>) -> Json<CertsResponse> {
    Json(CertsResponse {
        certificates: state.haproxy.available_certs(),
    })
}

#[derive(Serialize)]
struct AllCertsResponse {
    certificates: Vec<CertInfo>,
    count: usize,
}

async fn all_certs(State(state): State<AppState>) -> Json<AllCertsResponse> {
    let certificates = state.haproxy.all_certs_info().await;
    Json(AllCertsResponse {
        count: certificates.len(),
        certificates,
    })
}

async fn cert_info(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Json<CertInfo>> {
    state
        .haproxy
        .cert_info(&domain)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Certificate for {} not found", domain)))
}

#[derive(Deserialize)]
struct GenerateCertRequest {
    domain: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    method: CertMethod,
}

async fn generate_cert(
    State(state): State<AppState>,
    Json(request): Json<GenerateCertRequest>,
) -> Json<CertOutcome> {
    Json(
        state
            .haproxy
            .generate_certificate(&request.domain, request.email.as_deref(), request.method)
            .await,
    )
}

async fn renew_all_certs(State(state): State<AppState>) -> Json<RenewAllOutcome> {
    Json(state.haproxy.renew_certificates().await)
}

async fn renew_cert(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Json<CertOutcome> {
    Json(state.haproxy.renew_certificate(&domain).await)
}

#[derive(Serialize)]
struct UpdateCombinedResponse {
    updated: Vec<String>,
    count: usize,
}

async fn update_combined(State(state): State<AppState>) -> Json<UpdateCombinedResponse> {
    let updated = state.haproxy.update_combined_certs().await;
    Json(UpdateCombinedResponse {
        count: updated.len(),
        updated,
    })
}

async fn delete_cert(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.delete_certificate(&domain)?;
    Ok(Json(ActionResponse::ok(message)))
}

#[derive(Deserialize)]
struct UploadCertRequest {
    domain: String,
    cert_content: String,
    key_content: String,
}

async fn upload_cert(
    State(state): State<AppState>,
    Json(request): Json<UploadCertRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .haproxy
        .upload_certificate(&request.domain, &request.cert_content, &request.key_content)
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn cron_status(State(state): State<AppState>) -> Json<CronStatus> {
    Json(state.haproxy.cron_status())
}

async fn cron_setup(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.setup_cert_renewal_cron()?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn cron_remove(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.haproxy.remove_cert_renewal_cron()?;
    Ok(Json(ActionResponse::ok(message)))
}

// ── firewall ──

#[derive(Serialize)]
struct FirewallRulesResponse {
    rules: Vec<FirewallRule>,
    count: usize,
}

async fn firewall_rules(State(state): State<AppState>) -> Json<FirewallRulesResponse> {
    let rules = state.firewall.list().await;
    Json(FirewallRulesResponse {
        count: rules.len(),
        rules,
    })
}

#[derive(Deserialize)]
struct FirewallAddRequest {
    port: u16,
    #[serde(default = "default_tcp")]
    protocol: Protocol,
    #[serde(default = "default_allow")]
    action: FirewallAction,
    #[serde(default)]
    from_ip: Option<String>,
    #[serde(default = "default_in")]
    direction: Direction,
}

fn default_tcp() -> Protocol {
    Protocol::Tcp
}

fn default_allow() -> FirewallAction {
    FirewallAction::Allow
}

fn default_in() -> Direction {
    Direction::In
}

async fn firewall_add(
    State(state): State<AppState>,
    Json(request): Json<FirewallAddRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .firewall
        .add_advanced(
            request.port,
            request.protocol,
            request.action,
            request.from_ip.as_deref(),
            request.direction,
        )
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

#[derive(Deserialize)]
struct FirewallRemovePortRequest {
    port: u16,
    #[serde(default = "default_tcp")]
    protocol: Protocol,
}

async fn firewall_remove_port(
    State(state): State<AppState>,
    Json(request): Json<FirewallRemovePortRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state
        .firewall
        .remove_by_port(request.port, request.protocol)
        .await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn firewall_delete_number(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Json<ActionResponse>> {
    let message = state.firewall.remove_by_number(number).await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn firewall_status(State(state): State<AppState>) -> Json<FirewallStatus> {
    Json(state.firewall.status().await)
}

async fn firewall_enable(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.firewall.enable().await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn firewall_disable(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.firewall.disable().await?;
    Ok(Json(ActionResponse::ok(message)))
}

async fn firewall_reset(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let message = state.firewall.reset().await?;
    Ok(Json(ActionResponse::ok(message)))
}
