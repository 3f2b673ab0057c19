//! Client import URIs (`vmess://`, `vless://`, `trojan://`, `ss://`) and the
//! base64 subscription body built from them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use xpanel_db::models::client::Client;
use xpanel_db::models::inbound::{Inbound, Network, Protocol, Security};

use crate::error::{PanelError, Result};

const DEFAULT_ALPN: &str = "h2,http/1.1";
const DEFAULT_SS_METHOD: &str = "aes-256-gcm";

fn query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn ws_path(inbound: &Inbound) -> String {
    inbound
        .stream_settings
        .as_ref()
        .and_then(|s| s.0.pointer("/wsSettings/path"))
        .and_then(Value::as_str)
        .unwrap_or("/")
        .to_string()
}

fn tls_server_name(inbound: &Inbound, address: &str) -> String {
    inbound
        .tls_settings
        .as_ref()
        .and_then(|t| t.0.get("serverName"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(address)
        .to_string()
}

fn reality_value<'a>(inbound: &'a Inbound, pointer: &str) -> Option<&'a str> {
    inbound
        .reality_settings
        .as_ref()
        .and_then(|r| r.0.pointer(pointer))
        .and_then(Value::as_str)
}

fn credential<'a>(value: Option<&'a str>, what: &str, client: &Client) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PanelError::Validation(format!("Client {} has no {}", client.email, what)))
}

fn vmess(inbound: &Inbound, client: &Client, address: &str) -> Result<String> {
    let uuid = credential(client.uuid.as_deref(), "UUID", client)?;
    let tls = if inbound.security == Security::Tls { "tls" } else { "" };
    let config = json!({
        "v": "2",
        "ps": client.email,
        "add": address,
        "port": inbound.port.to_string(),
        "id": uuid,
        "aid": "0",
        "net": inbound.network.xray_name(),
        "type": "none",
        "host": "",
        "path": ws_path(inbound),
        "tls": tls,
    });
    Ok(format!("vmess://{}", STANDARD.encode(config.to_string())))
}

fn vless(inbound: &Inbound, client: &Client, address: &str) -> Result<String> {
    let uuid = credential(client.uuid.as_deref(), "UUID", client)?;
    let mut params = vec![
        ("type", inbound.network.xray_name().to_string()),
        ("security", inbound.security.xray_name().to_string()),
    ];
    if let Some(flow) = client.flow.as_deref().filter(|f| !f.is_empty()) {
        params.push(("flow", flow.to_string()));
    }
    match inbound.security {
        Security::Tls => {
            params.push(("sni", tls_server_name(inbound, address)));
            params.push(("alpn", DEFAULT_ALPN.to_string()));
        }
        Security::Reality => {
            let sni = reality_value(inbound, "/serverNames/0").unwrap_or(address);
            params.push(("sni", sni.to_string()));
            if let Some(pbk) = reality_value(inbound, "/publicKey") {
                params.push(("pbk", pbk.to_string()));
            }
            if let Some(sid) = reality_value(inbound, "/shortIds/0").filter(|s| !s.is_empty()) {
                params.push(("sid", sid.to_string()));
            }
            params.push(("fp", "chrome".to_string()));
        }
        Security::None => {}
    }
    if inbound.network == Network::Ws {
        params.push(("path", ws_path(inbound)));
        params.push(("host", address.to_string()));
    }
    Ok(format!(
        "vless://{}@{}:{}?{}#{}",
        uuid,
        address,
        inbound.port,
        query(&params),
        urlencoding::encode(&client.email)
    ))
}

fn trojan(inbound: &Inbound, client: &Client, address: &str) -> Result<String> {
    let password = credential(client.password.as_deref(), "password", client)?;
    let params = [
        ("type", inbound.network.xray_name().to_string()),
        ("security", inbound.security.xray_name().to_string()),
        ("sni", tls_server_name(inbound, address)),
        ("alpn", DEFAULT_ALPN.to_string()),
    ];
    Ok(format!(
        "trojan://{}@{}:{}?{}#{}",
        urlencoding::encode(password),
        address,
        inbound.port,
        query(&params),
        urlencoding::encode(&client.email)
    ))
}

/// The inbound's shared secret is what the proxy checks; the client row's
/// password is only a fallback.
fn shadowsocks(inbound: &Inbound, client: &Client, address: &str) -> Result<String> {
    let settings = &inbound.settings.0;
    let method = settings
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SS_METHOD);
    let inbound_password = settings.get("password").and_then(Value::as_str).filter(|p| !p.is_empty());
    let password = credential(inbound_password.or(client.password.as_deref()), "password", client)?;
    let userinfo = STANDARD.encode(format!("{}:{}", method, password));
    Ok(format!(
        "ss://{}@{}:{}#{}",
        userinfo,
        address,
        inbound.port,
        urlencoding::encode(&client.email)
    ))
}

/// Import URI for `client` on `inbound`, reachable at `address`.
pub fn share_link(inbound: &Inbound, client: &Client, address: &str) -> Result<String> {
    match inbound.protocol {
        Protocol::Vmess => vmess(inbound, client, address),
        Protocol::Vless => vless(inbound, client, address),
        Protocol::Trojan => trojan(inbound, client, address),
        Protocol::Shadowsocks => shadowsocks(inbound, client, address),
    }
}

/// One link per line, base64 as a whole, the format v2rayN-style clients fetch.
pub fn subscription_body(links: &[String]) -> String {
    STANDARD.encode(links.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    const HOST: &str = "vpn.example.com";

    fn inbound(protocol: Protocol, network: Network, security: Security) -> Inbound {
        let now = Utc::now();
        Inbound {
            id: 1,
            user_id: 1,
            remark: None,
            protocol,
            port: 443,
            listen: "0.0.0.0".into(),
            tag: "inbound-443".into(),
            settings: Json(json!({})),
            network,
            security,
            stream_settings: None,
            tls_settings: None,
            reality_settings: None,
            sniffing: None,
            is_active: true,
            up: 0,
            down: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn client(uuid: Option<&str>, password: Option<&str>) -> Client {
        let now = Utc::now();
        Client {
            id: 7,
            inbound_id: 1,
            email: "alice@example.com".into(),
            uuid: uuid.map(str::to_string),
            password: password.map(str::to_string),
            flow: None,
            traffic_limit: 0,
            expiry_time: None,
            enable: true,
            up: 0,
            down: 0,
            created_at: now,
            updated_at: now,
        }
    }

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn vmess_link_is_base64_json() {
        let mut ib = inbound(Protocol::Vmess, Network::Ws, Security::Tls);
        ib.stream_settings = Some(Json(json!({ "network": "ws", "wsSettings": { "path": "/ray" } })));
        let link = share_link(&ib, &client(Some(UUID), None), HOST).unwrap();

        let payload = link.strip_prefix("vmess://").unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(payload).unwrap()).unwrap();
        assert_eq!(decoded["v"], "2");
        assert_eq!(decoded["ps"], "alice@example.com");
        assert_eq!(decoded["add"], HOST);
        assert_eq!(decoded["port"], "443");
        assert_eq!(decoded["id"], UUID);
        assert_eq!(decoded["net"], "ws");
        assert_eq!(decoded["path"], "/ray");
        assert_eq!(decoded["tls"], "tls");
    }

    #[test]
    fn vless_tls_link_carries_flow_sni_and_alpn() {
        let mut ib = inbound(Protocol::Vless, Network::Tcp, Security::Tls);
        ib.tls_settings = Some(Json(json!({ "serverName": "cdn.example.com" })));
        let mut c = client(Some(UUID), None);
        c.flow = Some("xtls-rprx-vision".into());

        let link = share_link(&ib, &c, HOST).unwrap();
        assert_eq!(
            link,
            format!(
                "vless://{}@vpn.example.com:443?type=tcp&security=tls&flow=xtls-rprx-vision\
                 &sni=cdn.example.com&alpn=h2%2Chttp%2F1.1#alice%40example.com",
                UUID
            )
        );
    }

    #[test]
    fn vless_reality_link_uses_server_name_and_short_id() {
        let mut ib = inbound(Protocol::Vless, Network::Tcp, Security::Reality);
        ib.reality_settings = Some(Json(json!({
            "serverNames": ["www.microsoft.com"],
            "publicKey": "pubkey123",
            "shortIds": ["6ba85179e30d4fc2"]
        })));
        let link = share_link(&ib, &client(Some(UUID), None), HOST).unwrap();
        assert!(link.contains("security=reality"));
        assert!(link.contains("sni=www.microsoft.com"));
        assert!(link.contains("pbk=pubkey123"));
        assert!(link.contains("sid=6ba85179e30d4fc2"));
        assert!(link.contains("fp=chrome"));
    }

    #[test]
    fn vless_ws_link_names_path_and_host() {
        let ib = inbound(Protocol::Vless, Network::Ws, Security::None);
        let link = share_link(&ib, &client(Some(UUID), None), HOST).unwrap();
        assert!(link.contains("type=ws&security=none&path=%2F&host=vpn.example.com"));
    }

    #[test]
    fn trojan_link_defaults_sni_to_the_address() {
        let ib = inbound(Protocol::Trojan, Network::Tcp, Security::Tls);
        let link = share_link(&ib, &client(None, Some("0123abcd")), HOST).unwrap();
        assert_eq!(
            link,
            "trojan://0123abcd@vpn.example.com:443?type=tcp&security=tls&sni=vpn.example.com\
             &alpn=h2%2Chttp%2F1.1#alice%40example.com"
        );
    }

    #[test]
    fn shadowsocks_link_encodes_method_and_inbound_secret() {
        let mut ib = inbound(Protocol::Shadowsocks, Network::Tcp, Security::None);
        ib.settings = Json(json!({ "method": "chacha20-ietf-poly1305", "password": "shared" }));
        let link = share_link(&ib, &client(None, Some("per-client")), HOST).unwrap();

        let userinfo = link.strip_prefix("ss://").unwrap().split('@').next().unwrap();
        assert_eq!(STANDARD.decode(userinfo).unwrap(), b"chacha20-ietf-poly1305:shared");
        assert!(link.ends_with("@vpn.example.com:443#alice%40example.com"));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let ib = inbound(Protocol::Vless, Network::Tcp, Security::None);
        assert!(matches!(share_link(&ib, &client(None, None), HOST), Err(PanelError::Validation(_))));
    }

    #[test]
    fn subscription_body_joins_links_by_newline() {
        let body = subscription_body(&["vless://a".to_string(), "trojan://b".to_string()]);
        assert_eq!(STANDARD.decode(body).unwrap(), b"vless://a\ntrojan://b");
    }
}
