pub mod client_service;
pub mod config_sync;
pub mod inbound_service;
pub mod server_service;
pub mod share_link;

use serde::{Deserialize, Serialize};

use crate::error::{PanelError, Result};

pub use client_service::ClientService;
pub use config_sync::{ConfigSync, SyncOutcome};
pub use inbound_service::InboundService;
pub use server_service::ServerService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

/// Whoever is calling into a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
}

impl Actor {
    pub fn admin(user_id: i64) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn user(user_id: i64) -> Self {
        Self { user_id, role: Role::User }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins may touch anything; everyone else only what they own.
    pub fn authorize(&self, owner_id: i64) -> Result<()> {
        if self.is_admin() || self.user_id == owner_id {
            Ok(())
        } else {
            Err(PanelError::PermissionDenied)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: u32, limit: u32) -> Self {
        let limit = i64::from(limit.max(1));
        let pages = ((total.max(0) + limit - 1) / limit).max(1);
        Self {
            items,
            total,
            page: page.max(1),
            pages: u32::try_from(pages).unwrap_or(u32::MAX),
        }
    }
}
