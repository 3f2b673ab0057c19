use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Port {0} is already in use by another inbound")]
    PortConflict(u16),

    #[error("Tag '{0}' is already in use by another inbound")]
    TagConflict(String),

    #[error("Client '{email}' already exists in inbound {inbound_id}")]
    DuplicateEmail { inbound_id: i64, email: String },

    #[error("Xray rejected the configuration:\n{output}")]
    ConfigTestFailed { output: String },

    #[error("Failed to spawn Xray: {0}")]
    ProcessSpawnFailed(String),

    #[error("Failed to reach Xray stats API: {0}")]
    StatsUnreachable(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PanelError {
    /// HTTP-equivalent status for callers that surface errors over a web API.
    pub fn status_code(&self) -> u16 {
        match self {
            PanelError::InvalidConfig(_) | PanelError::Validation(_) => 400,
            PanelError::PermissionDenied => 403,
            PanelError::NotFound(_) => 404,
            PanelError::PortConflict(_)
            | PanelError::TagConflict(_)
            | PanelError::DuplicateEmail { .. }
            | PanelError::Conflict(_) => 409,
            PanelError::ConfigTestFailed { .. } => 422,
            PanelError::StatsUnreachable(_) => 502,
            PanelError::ProcessSpawnFailed(_) | PanelError::Internal(_) => 500,
        }
    }

    /// Worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, PanelError::StatsUnreachable(_))
    }
}

impl From<std::io::Error> for PanelError {
    fn from(err: std::io::Error) -> Self {
        PanelError::Internal(err.into())
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(err: serde_json::Error) -> Self {
        PanelError::Internal(err.into())
    }
}

pub type Result<T, E = PanelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_outage_maps_to_bad_gateway() {
        let err = PanelError::StatsUnreachable("connection refused".into());
        assert_eq!(err.status_code(), 502);
        assert!(err.is_transient());
    }

    #[test]
    fn uniqueness_violations_are_conflicts() {
        assert_eq!(PanelError::PortConflict(443).status_code(), 409);
        assert_eq!(PanelError::TagConflict("vless-in".into()).status_code(), 409);
        assert!(PanelError::PortConflict(443).to_string().contains("443"));
    }

    #[test]
    fn test_failures_carry_binary_output() {
        let err = PanelError::ConfigTestFailed { output: "unknown protocol: foo".into() };
        assert!(err.to_string().contains("unknown protocol: foo"));
        assert!(!err.is_transient());
    }
}
