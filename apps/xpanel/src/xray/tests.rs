use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use sqlx::types::Json;
use xpanel_db::models::client::Client;
use xpanel_db::models::inbound::{Inbound, Network, Protocol, Security};

use super::generator::{ConfigGenerator, GeneratorOptions};
use super::validator;

fn inbound(id: i64, protocol: Protocol, network: Network, security: Security) -> Inbound {
    let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    Inbound {
        id,
        user_id: 1,
        remark: None,
        protocol,
        port: 10000 + id as u16,
        listen: "0.0.0.0".to_string(),
        tag: format!("inbound-{}", 10000 + id),
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
        created_at: at,
        updated_at: at,
    }
}

fn client(id: i64, inbound_id: i64, email: &str) -> Client {
    let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    Client {
        id,
        inbound_id,
        email: email.to_string(),
        uuid: Some(format!("00000000-0000-4000-8000-{:012}", id)),
        password: Some(format!("{:032x}", id)),
        flow: None,
        traffic_limit: 0,
        expiry_time: None,
        enable: true,
        up: 0,
        down: 0,
        created_at: at,
        updated_at: at,
    }
}

fn render(inbound: &Inbound, clients: &[Client]) -> Value {
    serde_json::to_value(ConfigGenerator::generate_inbound(inbound, clients)).unwrap()
}

#[test]
fn same_record_renders_byte_identical_output() {
    let mut ib = inbound(1, Protocol::Vless, Network::Ws, Security::Tls);
    ib.settings = Json(json!({ "httpObfuscation": { "path": "/ray", "host": "cdn.example.com" } }));
    ib.tls_settings = Some(Json(json!({ "serverName": "example.com", "alpn": ["h2", "http/1.1"] })));
    let clients = vec![client(1, 1, "a@example.com"), client(2, 1, "b@example.com")];

    let first = serde_json::to_string(&ConfigGenerator::generate_inbound(&ib, &clients)).unwrap();
    let second = serde_json::to_string(&ConfigGenerator::generate_inbound(&ib, &clients)).unwrap();
    assert_eq!(first, second);

    let options = GeneratorOptions::default();
    let a = serde_json::to_string(&ConfigGenerator::generate_config(&options, &[ib.clone()], &clients, vec![])).unwrap();
    let b = serde_json::to_string(&ConfigGenerator::generate_config(&options, &[ib], &clients, vec![])).unwrap();
    assert_eq!(a, b);
}

#[test]
fn vmess_and_vless_clients_carry_id_email_and_flow() {
    let ib = inbound(1, Protocol::Vless, Network::Tcp, Security::Reality);
    let mut with_flow = client(1, 1, "a@example.com");
    with_flow.flow = Some("xtls-rprx-vision".to_string());
    let mut disabled = client(2, 1, "off@example.com");
    disabled.enable = false;
    let foreign = client(3, 2, "other@example.com");

    let out = render(&ib, &[with_flow, disabled, foreign]);
    let clients = out["settings"]["clients"].as_array().unwrap();

    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["email"], "a@example.com");
    assert_eq!(clients[0]["id"], "00000000-0000-4000-8000-000000000001");
    assert_eq!(clients[0]["flow"], "xtls-rprx-vision");
    assert_eq!(out["settings"]["decryption"], "none");
    assert_eq!(out["protocol"], "vless");

    let vmess = render(&inbound(1, Protocol::Vmess, Network::Tcp, Security::None), &[client(1, 1, "v@example.com")]);
    let entry = &vmess["settings"]["clients"][0];
    assert!(entry.get("flow").is_none());
    assert!(vmess["settings"].get("decryption").is_none());
}

#[test]
fn trojan_clients_carry_password_and_email() {
    let out = render(&inbound(1, Protocol::Trojan, Network::Tcp, Security::Tls), &[client(7, 1, "t@example.com")]);
    assert_eq!(out["settings"]["clients"], json!([{ "password": format!("{:032x}", 7), "email": "t@example.com" }]));
}

#[test]
fn shadowsocks_is_one_shared_secret_without_stream_settings() {
    let mut ib = inbound(1, Protocol::Shadowsocks, Network::Tcp, Security::None);
    ib.settings = Json(json!({ "password": "s3cret", "clients": [{ "email": "ignored" }] }));

    let out = render(&ib, &[client(1, 1, "a@example.com")]);

    assert_eq!(out["settings"], json!({ "method": "aes-256-gcm", "password": "s3cret", "network": "tcp,udp" }));
    assert!(out.get("streamSettings").is_none());
    assert_eq!(out["sniffing"]["enabled"], true);
}

#[test]
fn transport_presets_fill_in_missing_stream_settings() {
    let grpc = render(&inbound(1, Protocol::Vless, Network::Grpc, Security::None), &[]);
    assert_eq!(grpc["streamSettings"]["network"], "grpc");
    assert_eq!(grpc["streamSettings"]["grpcSettings"]["serviceName"], "");

    let kcp = render(&inbound(1, Protocol::Vmess, Network::Kcp, Security::None), &[]);
    assert_eq!(kcp["streamSettings"]["kcpSettings"]["mtu"], 1350);

    let h2 = render(&inbound(1, Protocol::Vmess, Network::Http2, Security::None), &[]);
    assert_eq!(h2["streamSettings"]["network"], "http");
    assert_eq!(h2["streamSettings"]["httpSettings"]["path"], "/");

    let tcp = render(&inbound(1, Protocol::Trojan, Network::Tcp, Security::None), &[]);
    assert_eq!(tcp["streamSettings"]["tcpSettings"]["header"]["type"], "none");
    assert_eq!(tcp["streamSettings"]["security"], "none");
}

#[test]
fn explicit_stream_settings_replace_the_preset() {
    let mut ib = inbound(1, Protocol::Vless, Network::Tcp, Security::None);
    ib.stream_settings = Some(Json(json!({
        "network": "tcp",
        "tcpSettings": { "header": { "type": "http" } }
    })));

    let out = render(&ib, &[]);
    assert_eq!(out["streamSettings"]["tcpSettings"]["header"]["type"], "http");
}

#[test]
fn only_the_matching_security_block_is_kept() {
    let mut ib = inbound(1, Protocol::Vless, Network::Tcp, Security::Reality);
    ib.tls_settings = Some(Json(json!({ "serverName": "stale.example.com" })));
    ib.reality_settings = Some(Json(json!({ "dest": "www.microsoft.com:443", "shortIds": [""] })));
    ib.stream_settings = Some(Json(json!({ "network": "tcp", "tlsSettings": { "old": true } })));

    let out = render(&ib, &[]);
    let stream = &out["streamSettings"];
    assert_eq!(stream["security"], "reality");
    assert_eq!(stream["realitySettings"]["dest"], "www.microsoft.com:443");
    assert!(stream.get("tlsSettings").is_none());

    ib.security = Security::Tls;
    let out = render(&ib, &[]);
    assert_eq!(out["streamSettings"]["tlsSettings"], json!({ "serverName": "stale.example.com" }));
    assert!(out["streamSettings"].get("realitySettings").is_none());
}

#[test]
fn ws_obfuscation_sets_path_and_host_header() {
    let mut ib = inbound(1, Protocol::Vmess, Network::Ws, Security::None);
    ib.settings = Json(json!({ "httpObfuscation": { "path": "/video", "host": "cdn.example.com" } }));

    let out = render(&ib, &[]);
    let ws = &out["streamSettings"]["wsSettings"];
    assert_eq!(ws["path"], "/video");
    assert_eq!(ws["headers"]["Host"], "cdn.example.com");
    assert!(out["settings"].get("httpObfuscation").is_none());

    let plain = render(&inbound(1, Protocol::Vmess, Network::Ws, Security::None), &[]);
    assert_eq!(plain["streamSettings"]["wsSettings"]["path"], "/");
}

#[test]
fn proxy_protocol_and_raw_sockopt_land_in_stream_sockopt() {
    let mut ib = inbound(1, Protocol::Trojan, Network::Tcp, Security::None);
    ib.settings = Json(json!({ "proxyProtocol": true, "sockopt": { "mark": 255, "tcpFastOpen": true } }));

    let out = render(&ib, &[]);
    let sockopt = &out["streamSettings"]["sockopt"];
    assert_eq!(sockopt["acceptProxyProtocol"], true);
    assert_eq!(sockopt["mark"], 255);
    assert_eq!(sockopt["tcpFastOpen"], true);
    assert!(out["settings"].get("proxyProtocol").is_none());
    assert!(out["settings"].get("sockopt").is_none());

    let bare = render(&inbound(1, Protocol::Trojan, Network::Tcp, Security::None), &[]);
    assert!(bare["streamSettings"].get("sockopt").is_none());
}

#[test]
fn full_document_has_fixed_outbounds_and_routing() {
    let mut inactive = inbound(2, Protocol::Vmess, Network::Tcp, Security::None);
    inactive.is_active = false;
    let rules = vec![json!({ "type": "field", "outboundTag": "block", "protocol": ["bittorrent"] })];

    let config = ConfigGenerator::generate_config(
        &GeneratorOptions::default(),
        &[inbound(1, Protocol::Vless, Network::Tcp, Security::None), inactive],
        &[client(1, 1, "a@example.com")],
        rules.clone(),
    );
    let doc = serde_json::to_value(&config).unwrap();

    assert_eq!(doc["inbounds"].as_array().unwrap().len(), 1);
    assert_eq!(doc["outbounds"], json!([
        { "protocol": "freedom", "tag": "direct" },
        { "protocol": "blackhole", "tag": "block" }
    ]));
    assert_eq!(doc["routing"]["domainStrategy"], "IPIfNonMatch");
    assert_eq!(doc["routing"]["rules"], Value::Array(rules));
    assert_eq!(doc["policy"]["levels"]["0"]["statsUserUplink"], true);
    assert_eq!(doc["policy"]["system"]["statsInboundDownlink"], true);
    assert_eq!(doc["dns"]["servers"], json!(["1.1.1.1", "8.8.8.8"]));
    assert_eq!(doc["log"]["loglevel"], "warning");
}

#[test]
fn generated_documents_pass_validation() {
    let mut ss = inbound(4, Protocol::Shadowsocks, Network::Tcp, Security::None);
    ss.settings = Json(json!({ "password": "pw" }));
    let mut ws = inbound(5, Protocol::Vmess, Network::Ws, Security::None);
    ws.settings = Json(json!({ "sockopt": { "tproxy": true, "mark": "7" } }));

    let inbounds = vec![
        inbound(1, Protocol::Vless, Network::Grpc, Security::Tls),
        inbound(2, Protocol::Vmess, Network::Kcp, Security::None),
        inbound(3, Protocol::Trojan, Network::Quic, Security::Tls),
        ss,
        ws,
    ];
    let clients: Vec<Client> = (1..=5).map(|i| client(i, i, &format!("u{}@example.com", i))).collect();

    let config = ConfigGenerator::generate_config(&GeneratorOptions::default(), &inbounds, &clients, vec![]);
    let doc = validator::validate_and_normalize(serde_json::to_value(config).unwrap()).unwrap();

    let sockopt = &doc["inbounds"][4]["streamSettings"]["sockopt"];
    assert_eq!(sockopt["tproxy"], "redirect");
    assert_eq!(sockopt["mark"], 7);
}
