//! # port-rules
//!
//! The port-automation rule engine: a stateless evaluator over the
//! attributes of a fresh lease. Every criterion a rule specifies must
//! match; matching rules emit webhook, log or tag actions. A bus
//! subscriber evaluates rules on each acknowledged lease.
#![warn(rust_2018_idioms, unreachable_pub)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dynconfig::{PortRule, PortRulesConfig, RuleAction};
use haven_core::prelude::*;

/// Attributes one evaluation runs over.
#[derive(Debug, Clone, Default)]
pub struct RuleInput {
    pub mac: String,
    pub ip: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub subnet: Option<Ipv4Net>,
    pub circuit_id: Option<String>,
    pub remote_id: Option<String>,
    pub device_type: Option<String>,
    pub vendor: Option<String>,
}

impl RuleInput {
    pub fn from_lease(lease: &Lease) -> Self {
        Self {
            mac: lease.mac.to_string(),
            ip: Some(lease.ip),
            hostname: lease.hostname.clone(),
            subnet: Some(lease.subnet),
            circuit_id: lease
                .relay
                .circuit_id
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            remote_id: lease
                .relay
                .remote_id
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            device_type: None,
            vendor: None,
        }
    }
}

/// One matched rule with its resolved action.
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule: String,
    pub action: RuleAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

struct CompiledRule {
    rule: PortRule,
    mac: Option<Regex>,
    circuit_id: Option<Regex>,
    remote_id: Option<Regex>,
}

fn compile(pattern: &Option<String>, rule: &str, what: &str) -> Option<Regex> {
    let pattern = pattern.as_ref()?;
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(rule, what, %pattern, ?err, "invalid rule regex, criterion can never match");
            // an uncompilable pattern must not silently widen the rule
            Some(Regex::new(r"$unmatchable^").expect("static regex"))
        }
    }
}

impl CompiledRule {
    fn new(rule: PortRule) -> Self {
        Self {
            mac: compile(&rule.mac_regex, &rule.name, "mac"),
            circuit_id: compile(&rule.circuit_id_regex, &rule.name, "circuit_id"),
            remote_id: compile(&rule.remote_id_regex, &rule.name, "remote_id"),
            rule,
        }
    }

    /// All specified criteria must match (AND).
    fn matches(&self, input: &RuleInput) -> bool {
        fn re_match(re: &Option<Regex>, value: Option<&str>) -> bool {
            match re {
                None => true,
                Some(re) => value.map(|v| re.is_match(v)).unwrap_or(false),
            }
        }
        re_match(&self.mac, Some(&self.input_mac(input)))
            && re_match(&self.circuit_id, input.circuit_id.as_deref())
            && re_match(&self.remote_id, input.remote_id.as_deref())
            && (self.rule.subnets.is_empty()
                || input
                    .subnet
                    .map(|s| self.rule.subnets.contains(&s))
                    .unwrap_or(false))
            && (self.rule.device_types.is_empty()
                || input
                    .device_type
                    .as_ref()
                    .map(|d| self.rule.device_types.iter().any(|t| t.eq_ignore_ascii_case(d)))
                    .unwrap_or(false))
    }

    fn input_mac(&self, input: &RuleInput) -> String {
        input.mac.to_lowercase()
    }
}

/// The compiled rule set.
pub struct RuleEngine {
    rules: RwLock<Vec<CompiledRule>>,
    client: reqwest::Client,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.read().len())
            .finish()
    }
}

/// The fixed webhook payload.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    rule: &'a str,
    action: RuleAction,
    mac: &'a str,
    ip: Option<Ipv4Addr>,
    hostname: Option<&'a str>,
    subnet: Option<String>,
    circuit_id: Option<&'a str>,
    remote_id: Option<&'a str>,
    device_type: Option<&'a str>,
    vendor: Option<&'a str>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    vlan: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
}

impl RuleEngine {
    pub fn new(config: PortRulesConfig) -> Self {
        Self {
            rules: RwLock::new(config.rules.into_iter().map(CompiledRule::new).collect()),
            client: reqwest::Client::new(),
        }
    }

    /// Recompile after a config change.
    pub fn set_rules(&self, config: PortRulesConfig) {
        *self.rules.write() =
            config.rules.into_iter().map(CompiledRule::new).collect();
    }

    /// Evaluate one input against every rule.
    pub fn evaluate(&self, input: &RuleInput) -> Vec<RuleMatch> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.matches(input))
            .map(|r| RuleMatch {
                rule: r.rule.name.clone(),
                action: r.rule.action,
                tag: r.rule.tag.clone(),
                vlan: r.rule.vlan,
                webhook_url: r.rule.webhook_url.clone(),
            })
            .collect()
    }

    /// Run the actions for one evaluation.
    pub async fn execute(&self, input: &RuleInput, matches: &[RuleMatch]) {
        for m in matches {
            metrics::RULE_MATCHES
                .with_label_values(&[match m.action {
                    RuleAction::Webhook => "webhook",
                    RuleAction::Log => "log",
                    RuleAction::Tag => "tag",
                }])
                .inc();
            match m.action {
                RuleAction::Log => {
                    info!(rule = %m.rule, mac = %input.mac, ip = ?input.ip, "port rule matched");
                }
                RuleAction::Tag => {
                    info!(rule = %m.rule, mac = %input.mac, tag = ?m.tag, vlan = ?m.vlan, "port rule tagged client");
                }
                RuleAction::Webhook => {
                    let Some(url) = &m.webhook_url else {
                        warn!(rule = %m.rule, "webhook rule without a url");
                        continue;
                    };
                    let payload = WebhookPayload {
                        rule: &m.rule,
                        action: m.action,
                        mac: &input.mac,
                        ip: input.ip,
                        hostname: input.hostname.as_deref(),
                        subnet: input.subnet.map(|s| s.to_string()),
                        circuit_id: input.circuit_id.as_deref(),
                        remote_id: input.remote_id.as_deref(),
                        device_type: input.device_type.as_deref(),
                        vendor: input.vendor.as_deref(),
                        timestamp: Utc::now().to_rfc3339(),
                        vlan: m.vlan,
                        tag: m.tag.as_deref(),
                    };
                    match self.client.post(url).json(&payload).send().await {
                        Ok(resp) => {
                            debug!(rule = %m.rule, status = %resp.status(), "webhook delivered")
                        }
                        Err(err) => warn!(rule = %m.rule, %err, "webhook delivery failed"),
                    }
                }
            }
        }
    }
}

/// Evaluate rules on each acknowledged or renewed lease until cancelled.
pub fn subscribe_lease_events(engine: Arc<RuleEngine>, bus: &Bus, cancel: CancellationToken) {
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = sub.recv() => {
                    let Some(ev) = ev else { break };
                    if !matches!(ev.kind, EventKind::LeaseAck | EventKind::LeaseRenew) {
                        continue;
                    }
                    let Some(lease) = &ev.lease else { continue };
                    let input = RuleInput::from_lease(lease);
                    let matches = engine.evaluate(&input);
                    if !matches.is_empty() {
                        engine.execute(&input, &matches).await;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> PortRule {
        PortRule {
            name: name.into(),
            action: RuleAction::Log,
            mac_regex: None,
            circuit_id_regex: None,
            remote_id_regex: None,
            subnets: vec![],
            device_types: vec![],
            webhook_url: None,
            tag: None,
            vlan: None,
        }
    }

    fn input(mac: &str) -> RuleInput {
        RuleInput {
            mac: mac.into(),
            ip: Some(Ipv4Addr::new(192, 168, 1, 100)),
            hostname: Some("cam-lobby".into()),
            subnet: Some("192.168.1.0/24".parse().unwrap()),
            circuit_id: Some("eth0/12".into()),
            remote_id: Some("sw-floor2".into()),
            device_type: Some("camera".into()),
            vendor: None,
        }
    }

    #[test]
    fn unconstrained_rule_matches_everything() {
        let engine = RuleEngine::new(PortRulesConfig {
            rules: vec![rule("all")],
        });
        assert_eq!(engine.evaluate(&input("aa:bb:cc:00:00:01")).len(), 1);
    }

    #[test]
    fn all_criteria_must_match() {
        let mut r = rule("cameras-floor2");
        r.mac_regex = Some("^aa:bb:".into());
        r.circuit_id_regex = Some("^eth0/".into());
        r.device_types = vec!["camera".into()];
        let engine = RuleEngine::new(PortRulesConfig { rules: vec![r] });

        assert_eq!(engine.evaluate(&input("aa:bb:cc:00:00:01")).len(), 1);
        // wrong mac prefix
        assert!(engine.evaluate(&input("de:ad:be:ef:00:01")).is_empty());
        // missing circuit id
        let mut no_circuit = input("aa:bb:cc:00:00:01");
        no_circuit.circuit_id = None;
        assert!(engine.evaluate(&no_circuit).is_empty());
        // wrong device type
        let mut printer = input("aa:bb:cc:00:00:01");
        printer.device_type = Some("printer".into());
        assert!(engine.evaluate(&printer).is_empty());
    }

    #[test]
    fn subnet_list_is_literal() {
        let mut r = rule("lan-only");
        r.subnets = vec!["192.168.1.0/24".parse().unwrap()];
        let engine = RuleEngine::new(PortRulesConfig { rules: vec![r] });

        assert_eq!(engine.evaluate(&input("aa:bb:cc:00:00:01")).len(), 1);
        let mut other = input("aa:bb:cc:00:00:01");
        other.subnet = Some("10.0.0.0/24".parse().unwrap());
        assert!(engine.evaluate(&other).is_empty());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let mut r = rule("broken");
        r.mac_regex = Some("([".into());
        let engine = RuleEngine::new(PortRulesConfig { rules: vec![r] });
        assert!(engine.evaluate(&input("aa:bb:cc:00:00:01")).is_empty());
    }

    #[test]
    fn match_carries_action_details() {
        let mut r = rule("tagger");
        r.action = RuleAction::Tag;
        r.tag = Some("iot".into());
        r.vlan = Some(42);
        let engine = RuleEngine::new(PortRulesConfig { rules: vec![r] });
        let matches = engine.evaluate(&input("aa:bb:cc:00:00:01"));
        assert_eq!(matches[0].action, RuleAction::Tag);
        assert_eq!(matches[0].tag.as_deref(), Some("iot"));
        assert_eq!(matches[0].vlan, Some(42));
    }

    #[test]
    fn webhook_payload_shape() {
        let payload = WebhookPayload {
            rule: "r",
            action: RuleAction::Webhook,
            mac: "aa:bb:cc:00:00:01",
            ip: Some(Ipv4Addr::new(192, 168, 1, 100)),
            hostname: Some("cam"),
            subnet: Some("192.168.1.0/24".into()),
            circuit_id: None,
            remote_id: None,
            device_type: None,
            vendor: None,
            timestamp: Utc::now().to_rfc3339(),
            vlan: None,
            tag: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["rule"], "r");
        assert_eq!(json["mac"], "aa:bb:cc:00:00:01");
        assert!(json.get("vlan").is_none());
        assert!(json.get("timestamp").is_some());
    }
}
