//! Let's Encrypt certificate management for HAProxy frontends.
//!
//! HAProxy wants a single PEM with the full chain and key concatenated,
//! so every flow ends by writing `combined.pem` (mode 600) into the
//! live directory. Certbot's standalone authenticator needs port 80
//! free, which means temporarily stopping HAProxy when a rule listens
//! there; the service is restarted on every exit path.

use crate::driver::HaproxyDriver;
use crate::error::{HaproxyError, Result};
use chrono::NaiveDateTime;
use edge_types::{CertMethod, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const RENEW_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertInfo {
    pub domain: String,
    pub expiry_date: String,
    pub days_left: i64,
    pub expired: bool,
    pub combined_exists: bool,
    pub cert_path: String,
    pub files: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewAllOutcome {
    pub success: bool,
    pub message: String,
    pub renewed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CronStatus {
    pub enabled: bool,
    pub cron_file: String,
    pub cron_exists: bool,
    pub script_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

fn certbot_available() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join("certbot").is_file())
}

async fn run_certbot(args: &[&str], timeout: Duration) -> (Option<i32>, String, String, bool) {
    let output = Command::new("certbot")
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        ),
        Ok(Err(e)) => (None, String::new(), e.to_string(), false),
        Err(_) => (None, String::new(), String::new(), true),
    }
}

impl HaproxyDriver {
    /// Find the live directory for a domain, handling certbot's
    /// `-0001`-style suffixes and symlinked directories.
    pub(crate) fn find_cert_dir(&self, domain: &str) -> Option<PathBuf> {
        let exact = self.certs_dir.join(domain);
        if exact.join("fullchain.pem").exists() {
            return Some(exact);
        }

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.certs_dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(domain))
                    .unwrap_or(false)
                    && p.join("fullchain.pem").exists()
            })
            .collect();
        candidates.sort();
        candidates.pop()
    }

    /// Write `combined.pem` as fullchain followed by privkey, mode 600.
    pub(crate) fn create_combined_cert(&self, domain: &str) -> Option<PathBuf> {
        let cert_dir = self
            .find_cert_dir(domain)
            .unwrap_or_else(|| self.certs_dir.join(domain));

        let fullchain = cert_dir.join("fullchain.pem");
        let privkey = cert_dir.join("privkey.pem");

        if !fullchain.exists() {
            warn!("fullchain.pem not found for {} at {}", domain, fullchain.display());
            return None;
        }
        if !privkey.exists() {
            warn!("privkey.pem not found for {} at {}", domain, privkey.display());
            return None;
        }

        let combined = cert_dir.join("combined.pem");
        let content = match (std::fs::read_to_string(&fullchain), std::fs::read_to_string(&privkey))
        {
            (Ok(chain), Ok(key)) => format!("{}{}", chain, key),
            _ => {
                error!("failed to read certificate files for {}", domain);
                return None;
            }
        };
        if let Err(e) = std::fs::write(&combined, content) {
            error!("failed to write combined cert for {}: {}", domain, e);
            return None;
        }
        let _ = std::fs::set_permissions(&combined, std::fs::Permissions::from_mode(0o600));
        info!("created combined cert for {} at {}", domain, combined.display());
        Some(combined)
    }

    /// Domains with a complete certificate under the live directory.
    pub fn available_certs(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.certs_dir) else {
            return Vec::new();
        };

        let mut certs: Vec<String> = entries
            .flatten()
            .filter(|e| {
                let path = e.path();
                e.file_name() != "README"
                    && path.is_dir()
                    && path.join("fullchain.pem").exists()
                    && path.join("privkey.pem").exists()
            })
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        certs.sort();
        certs
    }

    /// Expiry and file inventory for one domain's certificate.
    pub async fn cert_info(&self, domain: &str) -> Option<CertInfo> {
        let cert_dir = self
            .find_cert_dir(domain)
            .unwrap_or_else(|| self.certs_dir.join(domain));
        let cert_file = cert_dir.join("fullchain.pem");
        if !cert_file.exists() {
            return None;
        }

        let output = Command::new("openssl")
            .args(["x509", "-enddate", "-noout", "-in"])
            .arg(&cert_file)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let date_str = stdout.trim().split('=').nth(1)?;
        let expiry = parse_openssl_date(date_str)?;
        let days_left = (expiry - chrono::Utc::now().naive_utc()).num_days();

        let combined = cert_dir.join("combined.pem");
        let path_if_exists = |p: PathBuf| {
            if p.exists() {
                Some(p.display().to_string())
            } else {
                None
            }
        };

        let mut files = HashMap::new();
        files.insert("pem".to_string(), path_if_exists(combined.clone()));
        files.insert("key".to_string(), path_if_exists(cert_dir.join("privkey.pem")));
        files.insert("cert".to_string(), path_if_exists(cert_dir.join("cert.pem")));
        files.insert("fullchain".to_string(), Some(cert_file.display().to_string()));
        files.insert("chain".to_string(), path_if_exists(cert_dir.join("chain.pem")));

        Some(CertInfo {
            domain: domain.to_string(),
            expiry_date: expiry.format("%Y-%m-%dT%H:%M:%S").to_string(),
            days_left,
            expired: days_left < 0,
            combined_exists: combined.exists(),
            cert_path: cert_dir.display().to_string(),
            files,
        })
    }

    /// All certificates, sorted with the one closest to expiry first.
    pub async fn all_certs_info(&self) -> Vec<CertInfo> {
        let mut infos = Vec::new();
        for domain in self.available_certs() {
            if let Some(info) = self.cert_info(&domain).await {
                infos.push(info);
            }
        }
        infos.sort_by_key(|info| info.days_left);
        infos
    }

    /// Generate a certificate via certbot.
    pub async fn generate_certificate(
        &self,
        domain: &str,
        email: Option<&str>,
        method: CertMethod,
    ) -> CertOutcome {
        if !certbot_available() {
            return CertOutcome {
                success: false,
                message: "certbot not installed in container".into(),
                error_log: None,
            };
        }

        let mut cmd: Vec<String> = vec![
            "certonly".into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
        ];
        match email {
            Some(email) => {
                cmd.push("--email".into());
                cmd.push(email.to_string());
            }
            None => cmd.push("--register-unsafely-without-email".into()),
        }

        match method {
            CertMethod::Standalone => {
                // Port 80 must be reachable for the HTTP-01 challenge.
                match self.firewall.add_simple(80, Protocol::Tcp).await {
                    Ok(_) => info!("firewall: port 80 opened for certificate generation"),
                    Err(e) => warn!("could not open port 80: {}", e),
                }

                let was_running = self.is_running().await;
                let uses_port_80 = self.parse_rules().iter().any(|r| r.listen_port == 80);
                let stopped = uses_port_80 && was_running;

                if stopped {
                    if let Err(e) = self.temporary_stop().await {
                        return CertOutcome {
                            success: false,
                            message: format!("Failed to stop HAProxy: {}", e),
                            error_log: None,
                        };
                    }
                    info!("stopped HAProxy for certificate generation");
                }

                cmd.push("--standalone".into());
                cmd.push("-d".into());
                cmd.push(domain.to_string());
                let args: Vec<&str> = cmd.iter().map(String::as_str).collect();

                let (code, stdout, stderr, timed_out) =
                    run_certbot(&args, GENERATE_TIMEOUT).await;

                let outcome = if timed_out {
                    CertOutcome {
                        success: false,
                        message: "Certificate generation timed out (120s)".into(),
                        error_log: Some("Error: Timeout".into()),
                    }
                } else if code == Some(0) {
                    match self.find_cert_dir(domain) {
                        Some(cert_dir) => {
                            let actual = cert_dir
                                .file_name()
                                .and_then(|n| n.to_str())
                                .unwrap_or(domain)
                                .to_string();
                            self.create_combined_cert(&actual);
                            self.ensure_cert_renewal_cron();
                            info!("certificate for {} generated successfully", domain);
                            CertOutcome {
                                success: true,
                                message: format!(
                                    "Certificate for {} generated successfully",
                                    domain
                                ),
                                error_log: None,
                            }
                        }
                        None => CertOutcome {
                            success: false,
                            message: "Certificate created but directory not found".into(),
                            error_log: Some(format!("Looked in: {}", self.certs_dir.display())),
                        },
                    }
                } else {
                    let message = first_of(&stderr, &stdout, "Unknown error");
                    error!("certbot failed: {}", message);
                    CertOutcome {
                        success: false,
                        message,
                        error_log: Some(format!(
                            "Exit code: {:?}\n\nStdout:\n{}\n\nStderr:\n{}",
                            code, stdout, stderr
                        )),
                    }
                };

                // Restart unconditionally, even when certbot failed.
                if stopped {
                    match self.temporary_start().await {
                        Ok(()) => info!("HAProxy restarted after certificate generation"),
                        Err(e) => error!("failed to restart HAProxy: {}", e),
                    }
                }

                outcome
            }
            CertMethod::Webroot => {
                cmd.push("--webroot".into());
                cmd.push("-w".into());
                cmd.push("/var/www/html".into());
                cmd.push("-d".into());
                cmd.push(domain.to_string());
                let args: Vec<&str> = cmd.iter().map(String::as_str).collect();

                let (code, stdout, stderr, timed_out) =
                    run_certbot(&args, GENERATE_TIMEOUT).await;
                if timed_out {
                    return CertOutcome {
                        success: false,
                        message: "Certificate generation timed out (120s)".into(),
                        error_log: Some("Error: Timeout".into()),
                    };
                }
                if code == Some(0) {
                    if let Some(cert_dir) = self.find_cert_dir(domain) {
                        let actual = cert_dir
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or(domain)
                            .to_string();
                        self.create_combined_cert(&actual);
                    }
                    CertOutcome {
                        success: true,
                        message: format!("Certificate for {} generated successfully", domain),
                        error_log: None,
                    }
                } else {
                    CertOutcome {
                        success: false,
                        message: first_of(&stderr, &stdout, "Unknown error"),
                        error_log: Some(format!(
                            "Exit code: {:?}\n\nStdout:\n{}\n\nStderr:\n{}",
                            code, stdout, stderr
                        )),
                    }
                }
            }
        }
    }

    /// Renew every certificate certbot knows about, then refresh all
    /// combined certs.
    pub async fn renew_certificates(&self) -> RenewAllOutcome {
        if !certbot_available() {
            return RenewAllOutcome {
                success: false,
                message: "certbot not installed".into(),
                renewed: Vec::new(),
            };
        }

        info!("starting renewal of all certificates");

        match self.firewall.add_simple(80, Protocol::Tcp).await {
            Ok(_) => info!("firewall: port 80 opened for certificate renewal"),
            Err(e) => warn!("could not open port 80: {}", e),
        }

        let was_running = self.is_running().await;
        if was_running {
            if let Err(e) = self.temporary_stop().await {
                warn!("could not stop HAProxy: {}", e);
            } else {
                info!("stopped HAProxy for certificate renewal");
            }
        }

        let (code, stdout, stderr, timed_out) =
            run_certbot(&["renew", "--non-interactive"], RENEW_TIMEOUT).await;

        let mut renewed = Vec::new();
        let mut failed = 0usize;

        let outcome = if timed_out {
            error!("certificate renewal timed out");
            RenewAllOutcome {
                success: false,
                message: "Renewal timed out (300s)".into(),
                renewed: Vec::new(),
            }
        } else {
            let available = self.available_certs();
            info!("updating combined certificates for {} domains", available.len());
            for domain in available {
                if self.create_combined_cert(&domain).is_some() {
                    renewed.push(domain);
                } else {
                    failed += 1;
                    warn!("failed to update combined cert");
                }
            }

            if code == Some(0) {
                RenewAllOutcome {
                    success: true,
                    message: format!(
                        "Renewal completed. Updated: {}, Failed: {}",
                        renewed.len(),
                        failed
                    ),
                    renewed: renewed.clone(),
                }
            } else {
                let message = first_of(&stderr, &stdout, "Renewal failed");
                error!("renewal failed: {}", truncate(&message, 200));
                RenewAllOutcome {
                    success: false,
                    message,
                    renewed: renewed.clone(),
                }
            }
        };

        if was_running {
            match self.temporary_start().await {
                Ok(()) => info!("HAProxy restarted after certificate renewal"),
                Err(e) => error!("failed to restart HAProxy: {}", e),
            }
        }

        if !renewed.is_empty() {
            let _ = self.reload(false).await;
        }

        outcome
    }

    /// Force-renew one certificate with the standalone authenticator.
    pub async fn renew_certificate(&self, domain: &str) -> CertOutcome {
        if !certbot_available() {
            return CertOutcome {
                success: false,
                message: "certbot not installed".into(),
                error_log: None,
            };
        }

        if self.find_cert_dir(domain).is_none() {
            return CertOutcome {
                success: false,
                message: format!("Certificate for {} not found", domain),
                error_log: None,
            };
        }

        info!("starting certificate renewal for {}", domain);

        match self.firewall.add_simple(80, Protocol::Tcp).await {
            Ok(_) => info!("firewall: port 80 opened for certificate renewal"),
            Err(e) => warn!("could not open port 80: {}", e),
        }

        let was_running = self.is_running().await;
        if was_running {
            if let Err(e) = self.temporary_stop().await {
                warn!("could not stop HAProxy: {}", e);
            }
        }

        let args = [
            "certonly",
            "--standalone",
            "--non-interactive",
            "--agree-tos",
            "--register-unsafely-without-email",
            "--force-renewal",
            "-d",
            domain,
        ];
        let (code, stdout, stderr, timed_out) = run_certbot(&args, RENEW_TIMEOUT).await;

        let outcome = if timed_out {
            error!("certificate renewal timed out for {}", domain);
            CertOutcome {
                success: false,
                message: "Certificate renewal timed out (300s)".into(),
                error_log: Some("Error: Timeout".into()),
            }
        } else if code == Some(0) {
            match self.find_cert_dir(domain) {
                Some(cert_dir) => {
                    let actual = cert_dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or(domain)
                        .to_string();
                    self.create_combined_cert(&actual);
                    info!("certificate for {} renewed successfully", domain);
                    CertOutcome {
                        success: true,
                        message: format!("Certificate for {} renewed successfully", domain),
                        error_log: Some(format!(
                            "Exit code: {:?}\n\nStdout:\n{}\n\nStderr:\n{}",
                            code, stdout, stderr
                        )),
                    }
                }
                None => CertOutcome {
                    success: false,
                    message: format!("Certificate renewed but directory not found for {}", domain),
                    error_log: None,
                },
            }
        } else {
            let message = first_of(&stderr, &stdout, "Renewal failed");
            error!("certificate renewal failed for {}: {}", domain, truncate(&message, 200));
            CertOutcome {
                success: false,
                message,
                error_log: Some(format!(
                    "Exit code: {:?}\n\nStdout:\n{}\n\nStderr:\n{}",
                    code, stdout, stderr
                )),
            }
        };

        if was_running {
            match self.temporary_start().await {
                Ok(()) => info!("HAProxy restarted after certificate renewal"),
                Err(e) => error!("failed to restart HAProxy: {}", e),
            }
        }

        if outcome.success {
            let _ = self.reload(false).await;
        }

        outcome
    }

    /// Refresh every combined certificate from the live directories.
    pub async fn update_combined_certs(&self) -> Vec<String> {
        let mut updated = Vec::new();
        for domain in self.available_certs() {
            if self.create_combined_cert(&domain).is_some() {
                updated.push(domain);
            }
        }
        if !updated.is_empty() {
            let _ = self.reload(false).await;
        }
        updated
    }

    /// Delete the certificate files for a domain. Refused while any rule
    /// still references the certificate.
    pub fn delete_certificate(&self, domain: &str) -> Result<String> {
        let rules = self.parse_rules();
        let using: Vec<String> = rules
            .iter()
            .filter(|r| {
                r.cert_domain.as_deref().map_or(false, |cd| {
                    cd == domain
                        || cd.starts_with(&format!("{}-", domain))
                        || domain.starts_with(&format!("{}-", cd))
                })
            })
            .map(|r| r.name.clone())
            .collect();
        if !using.is_empty() {
            return Err(HaproxyError::Certificate(format!(
                "Certificate is used by rules: {}. Delete rules first.",
                using.join(", ")
            )));
        }

        let cert_dir = self
            .find_cert_dir(domain)
            .unwrap_or_else(|| self.certs_dir.join(domain));
        if !cert_dir.exists() {
            return Err(HaproxyError::Certificate(format!(
                "Certificate for {} not found",
                domain
            )));
        }

        let mut deleted = 0usize;
        for file in [
            "fullchain.pem",
            "privkey.pem",
            "cert.pem",
            "chain.pem",
            "combined.pem",
        ] {
            let path = cert_dir.join(file);
            if path.exists() && std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }

        if cert_dir
            .read_dir()
            .map(|mut d| d.next().is_none())
            .unwrap_or(false)
        {
            let _ = std::fs::remove_dir(&cert_dir);
        }

        if deleted == 0 {
            return Err(HaproxyError::Certificate(format!(
                "Certificate for {} not found",
                domain
            )));
        }

        info!("deleted certificate for {}", domain);
        Ok(format!(
            "Certificate for {} deleted successfully ({} files)",
            domain, deleted
        ))
    }

    /// Install a custom certificate pair.
    pub async fn upload_certificate(
        &self,
        domain: &str,
        cert_content: &str,
        key_content: &str,
    ) -> Result<String> {
        if domain.is_empty()
            || !domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(HaproxyError::Validation("Invalid domain name".into()));
        }
        if cert_content.is_empty() || key_content.is_empty() {
            return Err(HaproxyError::Validation(
                "Certificate and key content required".into(),
            ));
        }
        if !cert_content.contains("-----BEGIN CERTIFICATE-----") {
            return Err(HaproxyError::Validation(
                "Invalid certificate format (missing BEGIN CERTIFICATE)".into(),
            ));
        }
        if !key_content.contains("-----BEGIN") || !key_content.contains("PRIVATE KEY") {
            return Err(HaproxyError::Validation(
                "Invalid key format (missing PRIVATE KEY)".into(),
            ));
        }

        // Validate with openssl before touching the live directory.
        let tmp = tempfile_path();
        std::fs::write(&tmp, cert_content)?;
        let check = Command::new("openssl")
            .args(["x509", "-noout", "-in"])
            .arg(&tmp)
            .output()
            .await;
        let _ = std::fs::remove_file(&tmp);
        match check {
            Ok(output) if output.status.success() => {}
            _ => {
                return Err(HaproxyError::Certificate(
                    "Invalid certificate: OpenSSL validation failed".into(),
                ))
            }
        }

        let cert_dir = self.certs_dir.join(domain);
        std::fs::create_dir_all(&cert_dir)?;

        let fullchain = cert_dir.join("fullchain.pem");
        let privkey = cert_dir.join("privkey.pem");
        let combined = cert_dir.join("combined.pem");

        let write_all = || -> std::io::Result<()> {
            std::fs::write(&fullchain, format!("{}\n", cert_content.trim()))?;
            std::fs::set_permissions(&fullchain, std::fs::Permissions::from_mode(0o644))?;
            std::fs::write(&privkey, format!("{}\n", key_content.trim()))?;
            std::fs::set_permissions(&privkey, std::fs::Permissions::from_mode(0o600))?;
            std::fs::write(
                &combined,
                format!("{}\n{}\n", cert_content.trim(), key_content.trim()),
            )?;
            std::fs::set_permissions(&combined, std::fs::Permissions::from_mode(0o600))?;
            Ok(())
        };

        if let Err(e) = write_all() {
            let _ = std::fs::remove_file(&fullchain);
            let _ = std::fs::remove_file(&privkey);
            let _ = std::fs::remove_file(&combined);
            if cert_dir
                .read_dir()
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
            {
                let _ = std::fs::remove_dir(&cert_dir);
            }
            error!("failed to upload certificate: {}", e);
            return Err(HaproxyError::Certificate(format!("Failed to upload: {}", e)));
        }

        info!("uploaded certificate for {}", domain);
        Ok(format!("Certificate for {} uploaded successfully", domain))
    }

    // ── auto-renewal cron ──

    pub fn cron_status(&self) -> CronStatus {
        let cron_exists = self.cron_file.exists();
        let script_exists = self.renewal_script.exists();
        CronStatus {
            enabled: cron_exists && script_exists,
            cron_file: self.cron_file.display().to_string(),
            cron_exists,
            script_exists,
            schedule: cron_exists.then(|| "0 3 * * * (daily at 3:00 AM)".to_string()),
        }
    }

    /// Install the daily 03:00 renewal cron and its script.
    pub fn setup_cert_renewal_cron(&self) -> Result<String> {
        if let Some(parent) = self.renewal_script.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let script = r#"#!/bin/bash
# Renew Let's Encrypt certificates for the native HAProxy service.

if ! command -v certbot &> /dev/null; then
    echo "certbot not found"
    exit 1
fi

# Standalone mode needs port 80 free.
HAPROXY_WAS_RUNNING=false
if systemctl is-active --quiet haproxy; then
    HAPROXY_WAS_RUNNING=true
    systemctl stop haproxy
fi

certbot renew --non-interactive --quiet

# HAProxy wants fullchain and key concatenated.
for cert_dir in /etc/letsencrypt/live/*/; do
    if [ -d "$cert_dir" ]; then
        if [ -f "$cert_dir/fullchain.pem" ] && [ -f "$cert_dir/privkey.pem" ]; then
            cat "$cert_dir/fullchain.pem" "$cert_dir/privkey.pem" > "$cert_dir/combined.pem"
            chmod 600 "$cert_dir/combined.pem"
        fi
    fi
done

if [ "$HAPROXY_WAS_RUNNING" = true ]; then
    systemctl start haproxy
fi

if systemctl is-active --quiet haproxy; then
    systemctl reload haproxy 2>/dev/null || true
fi
"#;
        std::fs::write(&self.renewal_script, script)?;
        std::fs::set_permissions(&self.renewal_script, std::fs::Permissions::from_mode(0o755))?;

        let cron = format!(
            "# Auto-renewal of Let's Encrypt certificates\n# Runs daily at 3:00 AM\n0 3 * * * root {} >> /var/log/certbot-renew.log 2>&1\n",
            self.renewal_script.display()
        );
        std::fs::write(&self.cron_file, cron)?;
        std::fs::set_permissions(&self.cron_file, std::fs::Permissions::from_mode(0o644))?;

        info!("certificate auto-renewal cron configured");
        Ok("Certificate auto-renewal cron enabled (daily at 3:00 AM)".into())
    }

    pub fn remove_cert_renewal_cron(&self) -> Result<String> {
        let mut removed = Vec::new();
        if self.cron_file.exists() {
            std::fs::remove_file(&self.cron_file)?;
            removed.push("cron file");
        }
        if self.renewal_script.exists() {
            std::fs::remove_file(&self.renewal_script)?;
            removed.push("renewal script");
        }
        if removed.is_empty() {
            Ok("Cron was not configured".into())
        } else {
            info!("removed cert renewal cron: {}", removed.join(", "));
            Ok(format!("Removed: {}", removed.join(", ")))
        }
    }

    /// Auto-configure the cron whenever certificates exist without it.
    pub fn ensure_cert_renewal_cron(&self) {
        let status = self.cron_status();
        if !self.available_certs().is_empty() && !status.enabled {
            match self.setup_cert_renewal_cron() {
                Ok(_) => info!("auto-configured cert renewal cron"),
                Err(e) => debug!("could not configure cert renewal cron: {}", e),
            }
        }
    }
}

fn parse_openssl_date(date_str: &str) -> Option<NaiveDateTime> {
    // openssl prints e.g. "Mar  5 12:00:00 2026 GMT"; normalize padding
    // and drop the zone name before parsing.
    let normalized: Vec<&str> = date_str.split_whitespace().collect();
    if normalized.len() < 4 {
        return None;
    }
    let joined = normalized[..4].join(" ");
    NaiveDateTime::parse_from_str(&joined, "%b %d %H:%M:%S %Y").ok()
}

fn tempfile_path() -> PathBuf {
    std::env::temp_dir().join(format!("cert-upload-{}.pem", std::process::id()))
}

fn first_of(a: &str, b: &str, fallback: &str) -> String {
    if !a.trim().is_empty() {
        a.trim().to_string()
    } else if !b.trim().is_empty() {
        b.trim().to_string()
    } else {
        fallback.to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_openssl_date;

    #[test]
    fn parses_openssl_enddate() {
        let dt = parse_openssl_date("Mar 15 12:00:00 2026 GMT").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-03-15");
    }

    #[test]
    fn parses_padded_day() {
        let dt = parse_openssl_date("Mar  5 01:02:03 2026 GMT").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-03-05 01:02:03");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_openssl_date("not a date").is_none());
    }
}
