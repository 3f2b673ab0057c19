use serde_json::{Map, Value, json};
use xpanel_db::models::inbound::{Network, Protocol};

/// Stream settings used when an inbound does not carry its own.
pub fn stream_preset(network: Network) -> Value {
    match network {
        Network::Tcp => json!({
            "network": "tcp",
            "tcpSettings": { "header": { "type": "none" } }
        }),
        Network::Ws => json!({
            "network": "ws",
            "wsSettings": { "path": "/", "headers": {} }
        }),
        Network::Grpc => json!({
            "network": "grpc",
            "grpcSettings": { "serviceName": "" }
        }),
        Network::Http2 => json!({
            "network": "http",
            "httpSettings": { "host": [], "path": "/" }
        }),
        Network::Quic => json!({ "network": "quic" }),
        Network::Kcp => json!({
            "network": "kcp",
            "kcpSettings": { "mtu": 1350 }
        }),
    }
}

/// Protocol settings merged under whatever the caller supplied on create.
pub fn protocol_defaults(protocol: Protocol) -> Value {
    match protocol {
        Protocol::Vmess => json!({ "clients": [], "disableInsecureEncryption": false }),
        Protocol::Vless => json!({ "clients": [], "decryption": "none", "fallbacks": [] }),
        Protocol::Trojan => json!({ "clients": [], "fallbacks": [] }),
        Protocol::Shadowsocks => json!({ "method": "aes-256-gcm", "password": "", "network": "tcp,udp" }),
    }
}

pub fn default_sniffing() -> Value {
    json!({ "enabled": true, "destOverride": ["http", "tls", "quic"] })
}

pub fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Shallow merge: keys in `overrides` win, everything else comes from `base`.
pub fn merge_settings(base: Value, overrides: &Value) -> Value {
    let mut merged = into_object(base);
    if let Value::Object(extra) = overrides {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_network_has_a_matching_preset() {
        for network in Network::ALL {
            let preset = stream_preset(*network);
            assert_eq!(preset["network"], network.xray_name());
        }
    }

    #[test]
    fn caller_settings_override_defaults() {
        let merged = merge_settings(
            protocol_defaults(Protocol::Shadowsocks),
            &json!({ "method": "chacha20-ietf-poly1305", "password": "pw" }),
        );
        assert_eq!(merged["method"], "chacha20-ietf-poly1305");
        assert_eq!(merged["password"], "pw");
        assert_eq!(merged["network"], "tcp,udp");
    }
}
