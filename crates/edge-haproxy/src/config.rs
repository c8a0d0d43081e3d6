//! HAProxy config rendering and parsing.
//!
//! The config file is a deterministic base section followed by a rules
//! region delimited by sentinel comments. Rule CRUD rewrites only the
//! region; the base section is regenerated from the template.

use edge_types::RuleKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RULES_START_MARKER: &str = "# === RULES START ===";
pub const RULES_END_MARKER: &str = "# === RULES END ===";

/// One routing rule: a frontend bound to `listen_port` forwarding to
/// `target_ip:target_port`, TCP passthrough or TLS-terminating HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaproxyRule {
    pub name: String,
    pub rule_type: RuleKind,
    pub listen_port: u16,
    pub target_ip: String,
    pub target_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_domain: Option<String>,
    #[serde(default)]
    pub target_ssl: bool,
    #[serde(default)]
    pub send_proxy: bool,
}

/// Base config tuned for high-throughput TCP relaying.
pub fn base_config() -> String {
    format!(
        "global
    stats socket /var/run/haproxy.sock mode 660 level admin expose-fd listeners
    no log
    tune.bufsize 32768
    tune.maxpollevents 1024
    tune.recv_enough 16384

defaults
    mode tcp
    timeout connect 5s
    timeout client 30m
    timeout server 30m
    timeout tunnel 2h
    timeout client-fin 5s
    timeout server-fin 5s
    option dontlognull
    option redispatch
    option tcp-smart-accept
    option tcp-smart-connect
    option splice-auto
    option clitcpka
    option srvtcpka

{}
{}
",
        RULES_START_MARKER, RULES_END_MARKER
    )
}

/// Render the frontend+backend block for one rule. `cert_path` must be
/// the resolved combined certificate for HTTPS rules.
pub fn render_rule_block(rule: &HaproxyRule, cert_path: Option<&Path>) -> String {
    let frontend = format!("{}_{}", rule.rule_type.as_str(), rule.name);
    let backend = format!("backend_{}_{}", rule.rule_type.as_str(), rule.name);

    match rule.rule_type {
        RuleKind::Tcp => {
            let mut server_opts = String::new();
            if rule.send_proxy {
                server_opts.push_str(" send-proxy");
            }
            server_opts.push_str(" check inter 5s fall 3 rise 2");

            format!(
                "
frontend {frontend}
    bind *:{listen_port}
    mode tcp
    default_backend {backend}

backend {backend}
    mode tcp
    option tcp-check
    server srv1 {target_ip}:{target_port}{server_opts}
",
                frontend = frontend,
                backend = backend,
                listen_port = rule.listen_port,
                target_ip = rule.target_ip,
                target_port = rule.target_port,
                server_opts = server_opts,
            )
        }
        RuleKind::Https => {
            let cert = cert_path
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let mut server_line = format!("server srv1 {}:{}", rule.target_ip, rule.target_port);
            if rule.target_ssl {
                server_line.push_str(&format!(" ssl verify none sni str({})", rule.target_ip));
            }

            format!(
                "
frontend {frontend}
    bind *:{listen_port} ssl crt {cert}
    mode http
    default_backend {backend}

backend {backend}
    mode http
    http-request set-header Host {target_ip}
    http-request set-header X-Forwarded-Proto https
    http-request set-header X-Forwarded-For %[src]
    {server_line}
",
                frontend = frontend,
                backend = backend,
                listen_port = rule.listen_port,
                cert = cert,
                target_ip = rule.target_ip,
                server_line = server_line,
            )
        }
    }
}

#[derive(Debug)]
struct Block<'a> {
    keyword: &'a str,
    name: &'a str,
    lines: Vec<&'a str>,
}

/// Split a config into frontend/backend blocks. Content outside any
/// block (the base section) is ignored.
fn scan_blocks(content: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        let mut words = trimmed.split_whitespace();
        let first = words.next().unwrap_or("");

        if (first == "frontend" || first == "backend") && line.starts_with(first) {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some(Block {
                keyword: first,
                name: words.next().unwrap_or(""),
                lines: Vec::new(),
            });
        } else if trimmed.starts_with(RULES_END_MARKER) {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
        } else if let Some(block) = current.as_mut() {
            block.lines.push(line);
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn split_typed_name(name: &str) -> Option<(RuleKind, &str)> {
    let (kind, rest) = name.split_once('_')?;
    let kind = kind.parse().ok()?;
    Some((kind, rest))
}

/// Parse rules back out of the config file contents.
pub fn parse_rules(content: &str) -> Vec<HaproxyRule> {
    struct Frontend {
        rule_type: RuleKind,
        port: u16,
        cert_domain: Option<String>,
    }

    let mut frontends: std::collections::HashMap<String, Frontend> =
        std::collections::HashMap::new();
    let mut rules = Vec::new();

    let blocks = scan_blocks(content);

    for block in &blocks {
        if block.keyword != "frontend" {
            continue;
        }
        let Some((rule_type, name)) = split_typed_name(block.name) else {
            continue;
        };

        let mut port = 0u16;
        let mut cert_domain = None;
        for line in &block.lines {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("bind *:") {
                let port_str: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                port = port_str.parse().unwrap_or(0);
                if rule_type == RuleKind::Https {
                    cert_domain = extract_cert_domain(trimmed);
                }
            }
        }

        frontends.insert(
            name.to_string(),
            Frontend {
                rule_type,
                port,
                cert_domain,
            },
        );
    }

    for block in &blocks {
        if block.keyword != "backend" {
            continue;
        }
        let Some(rest) = block.name.strip_prefix("backend_") else {
            continue;
        };
        let Some((_, name)) = split_typed_name(rest) else {
            continue;
        };
        let Some(frontend) = frontends.get(name) else {
            continue;
        };

        for line in &block.lines {
            let trimmed = line.trim();
            if !trimmed.starts_with("server ") {
                continue;
            }
            let mut words = trimmed.split_whitespace();
            let _server = words.next();
            let _srv_name = words.next();
            let Some(addr) = words.next() else { continue };
            let Some((ip, port_str)) = addr.rsplit_once(':') else {
                continue;
            };
            let Ok(target_port) = port_str.parse::<u16>() else {
                continue;
            };

            let remainder: Vec<&str> = words.collect();
            rules.push(HaproxyRule {
                name: name.to_string(),
                rule_type: frontend.rule_type,
                listen_port: frontend.port,
                target_ip: ip.to_string(),
                target_port,
                cert_domain: frontend.cert_domain.clone(),
                target_ssl: remainder.contains(&"ssl"),
                send_proxy: remainder.contains(&"send-proxy"),
            });
            break;
        }
    }

    rules
}

fn extract_cert_domain(bind_line: &str) -> Option<String> {
    let idx = bind_line.find("ssl crt ")?;
    let path = bind_line[idx + "ssl crt ".len()..].split_whitespace().next()?;
    let path = path.strip_suffix("/combined.pem")?;
    path.rsplit('/').next().map(|s| s.to_string())
}

/// Remove one rule's frontend and backend blocks from the config,
/// returning the rewritten content.
pub fn remove_rule_blocks(content: &str, rule_type: RuleKind, name: &str) -> String {
    let frontend_header = format!("frontend {}_{}", rule_type.as_str(), name);
    let backend_header = format!("backend backend_{}_{}", rule_type.as_str(), name);

    let mut out = Vec::new();
    let mut skipping = false;

    for line in content.lines() {
        let header = line.trim_end();
        if header == frontend_header || header == backend_header {
            skipping = true;
            continue;
        }
        if skipping {
            let trimmed = line.trim_start();
            let is_block_start = (line.starts_with("frontend ") || line.starts_with("backend "))
                && !trimmed.is_empty();
            if is_block_start || trimmed.starts_with(RULES_END_MARKER) {
                skipping = false;
            } else {
                continue;
            }
        }
        out.push(line);
    }

    let mut result = out.join("\n");
    // Collapse runs of blank lines left behind by block removal.
    while result.contains("\n\n\n") {
        result = result.replace("\n\n\n", "\n\n");
    }
    if !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Insert a rendered rule block just before the end sentinel.
pub fn insert_rule_block(content: &str, block: &str) -> String {
    content.replace(
        RULES_END_MARKER,
        &format!("{}{}", block, RULES_END_MARKER),
    )
}

/// Extract the raw rules region (between the sentinels), if present.
pub fn rules_region(content: &str) -> Option<&str> {
    let start = content.find(RULES_START_MARKER)? + RULES_START_MARKER.len();
    let end = content.find(RULES_END_MARKER)?;
    content.get(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_rule() -> HaproxyRule {
        HaproxyRule {
            name: "ssh".into(),
            rule_type: RuleKind::Tcp,
            listen_port: 2222,
            target_ip: "10.0.0.1".into(),
            target_port: 22,
            cert_domain: None,
            target_ssl: false,
            send_proxy: false,
        }
    }

    #[test]
    fn base_config_carries_sentinels() {
        let config = base_config();
        assert!(config.contains(RULES_START_MARKER));
        assert!(config.contains(RULES_END_MARKER));
        assert!(config.contains("stats socket /var/run/haproxy.sock"));
        assert!(config.contains("option splice-auto"));
    }

    #[test]
    fn tcp_rule_round_trip() {
        let rule = tcp_rule();
        let block = render_rule_block(&rule, None);
        assert!(block.contains("bind *:2222"));
        assert!(block.contains("server srv1 10.0.0.1:22 check inter 5s fall 3 rise 2"));

        let config = insert_rule_block(&base_config(), &block);
        let parsed = parse_rules(&config);
        assert_eq!(parsed, vec![rule]);
    }

    #[test]
    fn https_rule_round_trip() {
        let rule = HaproxyRule {
            name: "web".into(),
            rule_type: RuleKind::Https,
            listen_port: 443,
            target_ip: "192.168.1.5".into(),
            target_port: 8443,
            cert_domain: Some("example.com".into()),
            target_ssl: true,
            send_proxy: false,
        };
        let cert = Path::new("/etc/letsencrypt/live/example.com/combined.pem");
        let block = render_rule_block(&rule, Some(cert));
        assert!(block.contains("ssl crt /etc/letsencrypt/live/example.com/combined.pem"));
        assert!(block.contains("ssl verify none sni str(192.168.1.5)"));

        let config = insert_rule_block(&base_config(), &block);
        let parsed = parse_rules(&config);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].cert_domain.as_deref(), Some("example.com"));
        assert!(parsed[0].target_ssl);
    }

    #[test]
    fn send_proxy_round_trip() {
        let mut rule = tcp_rule();
        rule.send_proxy = true;
        let block = render_rule_block(&rule, None);
        assert!(block.contains("send-proxy check"));
        let config = insert_rule_block(&base_config(), &block);
        assert!(parse_rules(&config)[0].send_proxy);
    }

    #[test]
    fn remove_leaves_other_rules_intact() {
        let mut config = base_config();
        let a = tcp_rule();
        let mut b = tcp_rule();
        b.name = "rdp".into();
        b.listen_port = 3390;
        b.target_port = 3389;

        config = insert_rule_block(&config, &render_rule_block(&a, None));
        config = insert_rule_block(&config, &render_rule_block(&b, None));
        assert_eq!(parse_rules(&config).len(), 2);

        let removed = remove_rule_blocks(&config, RuleKind::Tcp, "ssh");
        let parsed = parse_rules(&removed);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "rdp");
        assert!(removed.contains(RULES_END_MARKER));
    }

    #[test]
    fn remove_last_rule_empties_region() {
        let config = insert_rule_block(&base_config(), &render_rule_block(&tcp_rule(), None));
        let removed = remove_rule_blocks(&config, RuleKind::Tcp, "ssh");
        assert!(parse_rules(&removed).is_empty());
        assert!(rules_region(&removed).unwrap().trim().is_empty());
    }
}
