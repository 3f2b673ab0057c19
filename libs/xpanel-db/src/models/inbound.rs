use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

use super::client::Client;
use super::text_enum;
use crate::counters;

text_enum!(
    /// Proxy protocol spoken by an inbound.
    Protocol, "protocol" {
        Vmess => "VMESS",
        Vless => "VLESS",
        Trojan => "TROJAN",
        Shadowsocks => "SHADOWSOCKS",
    }
);

text_enum!(
    /// Transport carrying the protocol.
    Network, "network" {
        Tcp => "TCP",
        Ws => "WS",
        Grpc => "GRPC",
        Http2 => "HTTP2",
        Quic => "QUIC",
        Kcp => "KCP",
    }
);

text_enum!(
    Security, "security" {
        None => "NONE",
        Tls => "TLS",
        Reality => "REALITY",
    }
);

impl Protocol {
    /// Protocol name as written in the proxy configuration.
    pub fn xray_name(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
        }
    }

    /// Clients authenticate with a UUID rather than a password.
    pub fn uses_uuid(&self) -> bool {
        matches!(self, Protocol::Vmess | Protocol::Vless)
    }
}

impl Network {
    pub fn xray_name(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::Http2 => "http",
            Network::Quic => "quic",
            Network::Kcp => "kcp",
        }
    }
}

impl Security {
    pub fn xray_name(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Inbound {
    pub id: i64,
    pub user_id: i64,
    pub remark: Option<String>,
    #[sqlx(try_from = "String")]
    pub protocol: Protocol,
    pub port: u16,
    pub listen: String,
    pub tag: String,
    pub settings: Json<Value>,
    #[sqlx(try_from = "String")]
    pub network: Network,
    #[sqlx(try_from = "String")]
    pub security: Security,
    pub stream_settings: Option<Json<Value>>,
    pub tls_settings: Option<Json<Value>>,
    pub reality_settings: Option<Json<Value>>,
    pub sniffing: Option<Json<Value>>,
    pub is_active: bool,
    pub up: i64,
    pub down: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inbound {
    pub fn up_bytes(&self) -> u64 {
        counters::from_column(self.up)
    }

    pub fn down_bytes(&self) -> u64 {
        counters::from_column(self.down)
    }
}

/// Insert payload; identity, counters and timestamps are assigned by the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInbound {
    pub user_id: i64,
    pub remark: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    pub listen: String,
    pub tag: String,
    pub settings: Value,
    pub network: Network,
    pub security: Security,
    pub stream_settings: Option<Value>,
    pub tls_settings: Option<Value>,
    pub reality_settings: Option<Value>,
    pub sniffing: Option<Value>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InboundFilter {
    pub user_id: Option<i64>,
    pub protocol: Option<Protocol>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

/// Per-inbound client aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundClientTotals {
    pub client_count: u64,
    pub active_clients: u64,
    pub total_up: u64,
    pub total_down: u64,
}

impl InboundClientTotals {
    pub fn tally(clients: &[Client]) -> Self {
        clients.iter().fold(Self::default(), |mut acc, client| {
            acc.client_count += 1;
            if client.enable {
                acc.active_clients += 1;
            }
            acc.total_up = acc.total_up.saturating_add(client.up_bytes());
            acc.total_down = acc.total_down.saturating_add(client.down_bytes());
            acc
        })
    }
}
