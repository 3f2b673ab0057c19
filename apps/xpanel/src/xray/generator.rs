use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use xpanel_db::models::client::Client;
use xpanel_db::models::inbound::{Inbound, Network, Protocol, Security};

use super::config::*;
use super::presets;

/// Keys the panel keeps in an inbound's settings blob that the proxy must not see.
const PANEL_ONLY_KEYS: &[&str] = &["clients", "proxyProtocol", "sockopt", "httpObfuscation"];

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub log_level: String,
    pub dns_servers: Vec<String>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            log_level: "warning".to_string(),
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

/// Pure translation from stored inbounds/clients to proxy configuration.
pub struct ConfigGenerator;

impl ConfigGenerator {
    /// Everything except inbounds.
    pub fn base_config(options: &GeneratorOptions) -> XrayConfig {
        let mut levels = BTreeMap::new();
        levels.insert(
            "0".to_string(),
            LevelPolicy { stats_user_uplink: true, stats_user_downlink: true },
        );

        XrayConfig {
            log: LogConfig { loglevel: options.log_level.clone() },
            api: ApiConfig {
                tag: "api".to_string(),
                services: ["HandlerService", "LoggerService", "StatsService", "RoutingService"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            dns: Some(DnsConfig { servers: options.dns_servers.clone() }),
            stats: Some(StatsConfig::default()),
            policy: Some(PolicyConfig {
                levels,
                system: SystemPolicy {
                    stats_inbound_uplink: true,
                    stats_inbound_downlink: true,
                    stats_outbound_uplink: true,
                    stats_outbound_downlink: true,
                },
            }),
            inbounds: Vec::new(),
            outbounds: vec![OutboundConfig::direct(), OutboundConfig::block()],
            routing: RoutingConfig::default(),
        }
    }

    /// Full document for every active inbound. `clients` may contain clients of
    /// any inbound; each inbound picks its own enabled ones.
    pub fn generate_config(
        options: &GeneratorOptions,
        inbounds: &[Inbound],
        clients: &[Client],
        routing_rules: Vec<Value>,
    ) -> XrayConfig {
        let mut config = Self::base_config(options);
        config.inbounds = inbounds
            .iter()
            .filter(|inbound| inbound.is_active)
            .map(|inbound| Self::generate_inbound(inbound, clients))
            .collect();
        config.routing.rules = routing_rules;
        config
    }

    pub fn generate_inbound(inbound: &Inbound, clients: &[Client]) -> InboundConfig {
        let owned: Vec<&Client> = clients
            .iter()
            .filter(|c| c.inbound_id == inbound.id && c.enable)
            .collect();

        let stream_settings = match inbound.protocol {
            Protocol::Shadowsocks => None,
            _ => Some(Value::Object(Self::stream_settings(inbound))),
        };

        let sniffing = match inbound.sniffing.as_ref().map(|s| &s.0) {
            Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
            _ => presets::default_sniffing(),
        };

        InboundConfig {
            tag: inbound.tag.clone(),
            listen: inbound.listen.clone(),
            port: inbound.port,
            protocol: inbound.protocol.xray_name().to_string(),
            settings: Self::protocol_settings(inbound, &owned),
            stream_settings,
            sniffing: Some(sniffing),
        }
    }

    fn protocol_settings(inbound: &Inbound, clients: &[&Client]) -> Value {
        let raw = &inbound.settings.0;

        if inbound.protocol == Protocol::Shadowsocks {
            return json!({
                "method": str_or(raw, "method", "aes-256-gcm"),
                "password": str_or(raw, "password", ""),
                "network": str_or(raw, "network", "tcp,udp"),
            });
        }

        let mut settings = presets::into_object(raw.clone());
        for key in PANEL_ONLY_KEYS {
            settings.remove(*key);
        }

        let entries: Vec<Value> = match inbound.protocol {
            Protocol::Vmess | Protocol::Vless => clients
                .iter()
                .filter_map(|c| {
                    let id = c.uuid.as_deref().filter(|id| !id.is_empty())?;
                    let mut entry = Map::new();
                    entry.insert("id".to_string(), json!(id));
                    entry.insert("email".to_string(), json!(c.email));
                    if let Some(flow) = c.flow.as_deref().filter(|f| !f.is_empty()) {
                        entry.insert("flow".to_string(), json!(flow));
                    }
                    Some(Value::Object(entry))
                })
                .collect(),
            Protocol::Trojan => clients
                .iter()
                .filter_map(|c| {
                    let password = c.password.as_deref().filter(|p| !p.is_empty())?;
                    Some(json!({ "password": password, "email": c.email }))
                })
                .collect(),
            Protocol::Shadowsocks => Vec::new(),
        };
        settings.insert("clients".to_string(), Value::Array(entries));

        if inbound.protocol == Protocol::Vless && !settings.get("decryption").is_some_and(Value::is_string) {
            settings.insert("decryption".to_string(), json!("none"));
        }

        Value::Object(settings)
    }

    fn stream_settings(inbound: &Inbound) -> Map<String, Value> {
        let mut stream = match inbound.stream_settings.as_ref().map(|s| &s.0) {
            Some(Value::Object(map)) if !map.is_empty() => map.clone(),
            _ => presets::into_object(presets::stream_preset(inbound.network)),
        };
        stream
            .entry("network")
            .or_insert_with(|| json!(inbound.network.xray_name()));
        stream.insert("security".to_string(), json!(inbound.security.xray_name()));

        stream.remove("tlsSettings");
        stream.remove("realitySettings");
        match inbound.security {
            Security::Tls => {
                if let Some(tls) = &inbound.tls_settings {
                    stream.insert("tlsSettings".to_string(), tls.0.clone());
                }
            }
            Security::Reality => {
                if let Some(reality) = &inbound.reality_settings {
                    stream.insert("realitySettings".to_string(), reality.0.clone());
                }
            }
            Security::None => {}
        }

        let raw = &inbound.settings.0;

        let mut sockopt = stream
            .remove("sockopt")
            .map(presets::into_object)
            .unwrap_or_default();
        if let Some(Value::Object(extra)) = raw.get("sockopt") {
            for (key, value) in extra {
                sockopt.insert(key.clone(), value.clone());
            }
        }
        if raw.get("proxyProtocol").is_some_and(truthy) {
            sockopt.insert("acceptProxyProtocol".to_string(), json!(true));
        }
        if !sockopt.is_empty() {
            stream.insert("sockopt".to_string(), Value::Object(sockopt));
        }

        if inbound.network == Network::Ws {
            let obfuscation = raw.get("httpObfuscation");
            let mut ws = stream
                .remove("wsSettings")
                .map(presets::into_object)
                .unwrap_or_default();

            let path = obfuscation
                .and_then(|o| o.get("path"))
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .or_else(|| ws.get("path").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "/".to_string());
            ws.insert("path".to_string(), json!(path));

            let mut headers = ws
                .remove("headers")
                .map(presets::into_object)
                .unwrap_or_default();
            if let Some(host) = obfuscation
                .and_then(|o| o.get("host"))
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
            {
                headers.insert("Host".to_string(), json!(host));
            }
            ws.insert("headers".to_string(), Value::Object(headers));

            stream.insert("wsSettings".to_string(), Value::Object(ws));
        }

        stream
    }
}

fn str_or(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}
