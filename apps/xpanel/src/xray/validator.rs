//! Schema check and canonicalisation of full proxy configuration documents.

use serde_json::{Map, Value};

use crate::error::{PanelError, Result};

pub const SUPPORTED_PROTOCOLS: &[&str] = &["vmess", "vless", "trojan", "shadowsocks"];
pub const STREAM_NETWORKS: &[&str] = &["tcp", "ws", "grpc", "http", "quic", "kcp"];
pub const STREAM_SECURITY: &[&str] = &["none", "tls", "reality"];
pub const TPROXY_MODES: &[&str] = &["off", "redirect", "tproxy"];

/// Metadata a stored row may carry that never belongs in the proxy's file.
pub const STORAGE_ONLY_KEYS: &[&str] = &["id", "isActive", "createdAt", "updatedAt"];

/// Validates `document`, then returns its canonical form.
pub fn validate_and_normalize(document: Value) -> Result<Value> {
    validate(&document)?;
    Ok(normalize(document))
}

/// Reports every schema problem at once so the caller can fix them in one pass.
pub fn validate(document: &Value) -> Result<()> {
    let Some(root) = document.as_object() else {
        return Err(PanelError::InvalidConfig("configuration must be a JSON object".into()));
    };

    let mut problems = Vec::new();

    for key in ["log", "api", "routing"] {
        match root.get(key) {
            Some(Value::Object(_)) => {}
            Some(_) => problems.push(format!("\"{}\" must be an object", key)),
            None => problems.push(format!("\"{}\" is required", key)),
        }
    }
    for key in ["dns", "policy", "stats"] {
        if let Some(value) = root.get(key) {
            if !value.is_object() {
                problems.push(format!("\"{}\" must be an object", key));
            }
        }
    }

    match root.get("inbounds") {
        Some(Value::Array(inbounds)) if inbounds.is_empty() => {
            problems.push("\"inbounds\" must contain at least 1 item".into())
        }
        Some(Value::Array(inbounds)) => {
            for (index, inbound) in inbounds.iter().enumerate() {
                check_inbound(index, inbound, &mut problems);
            }
        }
        Some(_) => problems.push("\"inbounds\" must be an array".into()),
        None => problems.push("\"inbounds\" is required".into()),
    }

    match root.get("outbounds") {
        Some(Value::Array(outbounds)) if outbounds.is_empty() => {
            problems.push("\"outbounds\" must contain at least 1 item".into())
        }
        Some(Value::Array(outbounds)) => {
            for (index, outbound) in outbounds.iter().enumerate() {
                if !outbound.get("protocol").is_some_and(Value::is_string) {
                    problems.push(format!("\"outbounds[{}].protocol\" is required", index));
                }
            }
        }
        Some(_) => problems.push("\"outbounds\" must be an array".into()),
        None => problems.push("\"outbounds\" is required".into()),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PanelError::InvalidConfig(problems.join("; ")))
    }
}

fn check_inbound(index: usize, inbound: &Value, problems: &mut Vec<String>) {
    let Some(inbound) = inbound.as_object() else {
        problems.push(format!("\"inbounds[{}]\" must be an object", index));
        return;
    };

    match inbound.get("port").and_then(Value::as_u64) {
        Some(port) if (1..=65535).contains(&port) => {}
        Some(_) => problems.push(format!("\"inbounds[{}].port\" must be between 1 and 65535", index)),
        None => problems.push(format!("\"inbounds[{}].port\" is required", index)),
    }

    match inbound.get("protocol").and_then(Value::as_str) {
        Some(protocol) if SUPPORTED_PROTOCOLS.contains(&protocol) => {}
        Some(protocol) => problems.push(format!(
            "\"inbounds[{}].protocol\" must be one of [{}], got \"{}\"",
            index,
            SUPPORTED_PROTOCOLS.join(", "),
            protocol
        )),
        None => problems.push(format!("\"inbounds[{}].protocol\" is required", index)),
    }

    if !inbound.get("settings").is_some_and(Value::is_object) {
        problems.push(format!("\"inbounds[{}].settings\" is required", index));
    }

    if let Some(stream) = inbound.get("streamSettings") {
        match stream.as_object() {
            Some(stream) => {
                match stream.get("network").and_then(Value::as_str) {
                    Some(network) if STREAM_NETWORKS.contains(&network) => {}
                    Some(network) => problems.push(format!(
                        "\"inbounds[{}].streamSettings.network\" must be one of [{}], got \"{}\"",
                        index,
                        STREAM_NETWORKS.join(", "),
                        network
                    )),
                    None => problems.push(format!("\"inbounds[{}].streamSettings.network\" is required", index)),
                }
                if let Some(security) = stream.get("security") {
                    if !security.as_str().is_some_and(|s| STREAM_SECURITY.contains(&s)) {
                        problems.push(format!(
                            "\"inbounds[{}].streamSettings.security\" must be one of [{}]",
                            index,
                            STREAM_SECURITY.join(", ")
                        ));
                    }
                }
            }
            None => problems.push(format!("\"inbounds[{}].streamSettings\" must be an object", index)),
        }
    }

    if let Some(sniffing) = inbound.get("sniffing") {
        if !sniffing.is_object() {
            problems.push(format!("\"inbounds[{}].sniffing\" must be an object", index));
        }
    }
}

/// Canonicalises fields the proxy is strict about. Safe to run on any input.
pub fn normalize(mut document: Value) -> Value {
    if let Some(root) = document.as_object_mut() {
        for key in STORAGE_ONLY_KEYS {
            root.remove(*key);
        }
        for list in ["inbounds", "outbounds"] {
            if let Some(Value::Array(entries)) = root.get_mut(list) {
                for entry in entries.iter_mut() {
                    if let Some(Value::Object(sockopt)) = entry
                        .get_mut("streamSettings")
                        .and_then(|s| s.get_mut("sockopt"))
                    {
                        normalize_sockopt(sockopt);
                    }
                }
            }
        }
    }
    document
}

/// `tproxy` becomes one of "off" / "redirect" / "tproxy"; `mark` becomes a number or goes away.
pub fn normalize_sockopt(sockopt: &mut Map<String, Value>) {
    let tproxy = match sockopt.get("tproxy") {
        Some(Value::Bool(true)) => "redirect".to_string(),
        Some(Value::String(mode)) if TPROXY_MODES.contains(&mode.as_str()) => mode.clone(),
        _ => "off".to_string(),
    };
    sockopt.insert("tproxy".to_string(), Value::String(tproxy));

    if let Some(mark) = sockopt.remove("mark") {
        if let Some(number) = coerce_number(&mark) {
            sockopt.insert("mark".to_string(), number);
        }
    }
}

fn coerce_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(int) = s.parse::<i64>() {
                return Some(Value::from(int));
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }
        _ => None,
    }
}
