//! Filesystem-level certificate handling tests (no haproxy binary needed).

use edge_exec::{HostExecutor, NsenterRunner};
use edge_haproxy::{HaproxyDriver, HaproxyPaths};
use edge_network::FirewallDriver;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

fn driver_in(dir: &tempfile::TempDir) -> HaproxyDriver {
    let executor = Arc::new(HostExecutor::with_nsenter(false));
    let firewall = Arc::new(FirewallDriver::new(Arc::new(NsenterRunner::with_nsenter(
        false,
    ))));
    HaproxyDriver::new(
        executor,
        firewall,
        HaproxyPaths {
            config_path: dir.path().join("haproxy.cfg"),
            certs_dir: dir.path().join("live"),
            cron_file: dir.path().join("cron.d/certbot-renew"),
            renewal_script: dir.path().join("renew-certs.sh"),
        },
    )
}

fn seed_cert(dir: &tempfile::TempDir, name: &str) {
    let cert_dir = dir.path().join("live").join(name);
    std::fs::create_dir_all(&cert_dir).unwrap();
    std::fs::write(cert_dir.join("fullchain.pem"), "CHAIN\n").unwrap();
    std::fs::write(cert_dir.join("privkey.pem"), "KEY\n").unwrap();
}

#[tokio::test]
async fn available_certs_lists_complete_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);

    seed_cert(&dir, "b.example.com");
    seed_cert(&dir, "a.example.com");
    // Incomplete: key missing.
    let incomplete = dir.path().join("live/c.example.com");
    std::fs::create_dir_all(&incomplete).unwrap();
    std::fs::write(incomplete.join("fullchain.pem"), "CHAIN\n").unwrap();

    assert_eq!(
        driver.available_certs(),
        vec!["a.example.com", "b.example.com"]
    );
}

#[tokio::test]
async fn suffixed_cert_dir_is_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);
    seed_cert(&dir, "example.com-0001");

    // Combined-cert refresh resolves the suffixed directory.
    let updated = driver.update_combined_certs().await;
    assert_eq!(updated, vec!["example.com-0001"]);
    assert!(dir
        .path()
        .join("live/example.com-0001/combined.pem")
        .exists());
}

#[tokio::test]
async fn generate_without_certbot_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);

    let generated = driver
        .generate_certificate("example.com", None, edge_types::CertMethod::Standalone)
        .await;
    // certbot is not installed in the test environment.
    assert!(!generated.success);
    assert!(generated.message.contains("certbot not installed"));
}

#[tokio::test]
async fn combined_cert_has_mode_600() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);
    seed_cert(&dir, "example.com");

    let updated = driver.update_combined_certs().await;
    assert_eq!(updated, vec!["example.com"]);

    let combined = dir.path().join("live/example.com/combined.pem");
    let content = std::fs::read_to_string(&combined).unwrap();
    assert_eq!(content, "CHAIN\nKEY\n");

    let mode = std::fs::metadata(&combined).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn delete_refuses_while_rule_references_cert() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);
    seed_cert(&dir, "example.com");

    // Write a config referencing the certificate directly; the rules
    // region parser will pick it up.
    let config = format!(
        "{}\n\nfrontend https_web\n    bind *:443 ssl crt {}/live/example.com/combined.pem\n    mode http\n    default_backend backend_https_web\n\nbackend backend_https_web\n    mode http\n    server srv1 10.0.0.1:8443\n{}\n",
        edge_haproxy::RULES_START_MARKER,
        dir.path().display(),
        edge_haproxy::RULES_END_MARKER,
    );
    std::fs::write(dir.path().join("haproxy.cfg"), config).unwrap();

    let err = driver.delete_certificate("example.com").unwrap_err();
    assert!(err.to_string().contains("used by rules"));
}

#[tokio::test]
async fn delete_removes_files_and_empty_dir() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);
    seed_cert(&dir, "old.example.com");

    let message = driver.delete_certificate("old.example.com").unwrap();
    assert!(message.contains("deleted successfully"));
    assert!(!dir.path().join("live/old.example.com").exists());
}

#[tokio::test]
async fn cron_setup_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);

    let status = driver.cron_status();
    assert!(!status.enabled);

    driver.setup_cert_renewal_cron().unwrap();
    let status = driver.cron_status();
    assert!(status.enabled);
    assert_eq!(status.schedule.as_deref(), Some("0 3 * * * (daily at 3:00 AM)"));

    let cron = std::fs::read_to_string(dir.path().join("cron.d/certbot-renew")).unwrap();
    assert!(cron.contains("0 3 * * * root"));

    let script_mode = std::fs::metadata(dir.path().join("renew-certs.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(script_mode & 0o777, 0o755);

    driver.remove_cert_renewal_cron().unwrap();
    assert!(!driver.cron_status().enabled);
}

#[tokio::test]
async fn upload_rejects_malformed_input() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver_in(&dir);

    assert!(driver
        .upload_certificate("bad domain!", "x", "y")
        .await
        .is_err());
    assert!(driver
        .upload_certificate("ok.example.com", "no markers", "no key")
        .await
        .is_err());
}
