//! Deployment phase model.
//!
//! A node's lifecycle is a totally ordered sequence of phases followed by
//! the terminal `failed`/`cleaned` pair. Every incoming signal is checked
//! against the ordering index before it may move the cached phase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Deployment phase of a node, in expected order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    ServerRequested,
    ServerProvisioning,
    ServerRunning,
    IpxeBoot,
    ConfigDownload,
    FoundationStart,
    StorageDiscovery,
    ImageDownload,
    Installation,
    ClusterFormation,
    DnsRegistration,
    HealthValidation,
    Deployed,
    Failed,
    Cleaned,
}

impl Phase {
    /// Every phase in ordering-index order.
    pub const ALL: [Phase; 16] = [
        Phase::Pending,
        Phase::ServerRequested,
        Phase::ServerProvisioning,
        Phase::ServerRunning,
        Phase::IpxeBoot,
        Phase::ConfigDownload,
        Phase::FoundationStart,
        Phase::StorageDiscovery,
        Phase::ImageDownload,
        Phase::Installation,
        Phase::ClusterFormation,
        Phase::DnsRegistration,
        Phase::HealthValidation,
        Phase::Deployed,
        Phase::Failed,
        Phase::Cleaned,
    ];

    /// Ordering index. Higher means later in the lifecycle.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::ServerRequested => "server_requested",
            Phase::ServerProvisioning => "server_provisioning",
            Phase::ServerRunning => "server_running",
            Phase::IpxeBoot => "ipxe_boot",
            Phase::ConfigDownload => "config_download",
            Phase::FoundationStart => "foundation_start",
            Phase::StorageDiscovery => "storage_discovery",
            Phase::ImageDownload => "image_download",
            Phase::Installation => "installation",
            Phase::ClusterFormation => "cluster_formation",
            Phase::DnsRegistration => "dns_registration",
            Phase::HealthValidation => "health_validation",
            Phase::Deployed => "deployed",
            Phase::Failed => "failed",
            Phase::Cleaned => "cleaned",
        }
    }

    /// `failed` and `cleaned`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed | Phase::Cleaned)
    }

    /// No further monitoring is needed: deployed, failed or cleaned.
    pub fn is_settled(self) -> bool {
        self == Phase::Deployed || self.is_terminal()
    }

    /// Phases a booting node is allowed to report about itself.
    pub fn is_node_reported(self) -> bool {
        (Phase::IpxeBoot.index()..=Phase::Installation.index()).contains(&self.index())
    }

    /// Whether the provider server may still be coming up.
    pub fn awaits_provider(self) -> bool {
        matches!(
            self,
            Phase::ServerRequested | Phase::ServerProvisioning | Phase::ServerRunning
        )
    }

    /// Install has finished and the node may take part in cluster formation.
    pub fn is_ready(self) -> bool {
        !self.is_terminal() && self.index() >= Phase::ClusterFormation.index()
    }

    /// Whether a node currently in `self` may move to `next`.
    ///
    /// Forward moves (including staying in the same phase) are allowed from
    /// any non-terminal phase. `failed` is reachable from every non-terminal
    /// phase and `cleaned` from everything except itself.
    pub fn can_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Cleaned, _) => false,
            (_, Phase::Cleaned) => true,
            (current, Phase::Failed) => !current.is_terminal(),
            (current, next) => !current.is_terminal() && next.index() >= current.index(),
        }
    }

    /// Nominal completion percentage shown for the phase.
    pub fn progress(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::ServerRequested => 5,
            Phase::ServerProvisioning => 10,
            Phase::ServerRunning => 15,
            Phase::IpxeBoot => 20,
            Phase::ConfigDownload => 25,
            Phase::FoundationStart => 35,
            Phase::StorageDiscovery => 45,
            Phase::ImageDownload => 55,
            Phase::Installation => 70,
            Phase::ClusterFormation => 80,
            Phase::DnsRegistration => 88,
            Phase::HealthValidation => 95,
            Phase::Deployed => 100,
            Phase::Failed | Phase::Cleaned => 0,
        }
    }

    /// The phase that follows a completed `self` in the straight-line flow.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Deployed | Phase::Failed | Phase::Cleaned => None,
            other => Phase::ALL.get(other.index() as usize + 1).copied(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a phase name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase: {0}")]
pub struct PhaseParseError(pub String);

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| PhaseParseError(s.to_string()))
    }
}

/// Status of a single phase attempt, as recorded in the event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

impl FromStr for EventStatus {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" | "start" => Ok(EventStatus::Started),
            "in_progress" | "in-progress" | "running" | "progress" => Ok(EventStatus::InProgress),
            "completed" | "complete" | "success" | "done" => Ok(EventStatus::Completed),
            "failed" | "failure" | "error" => Ok(EventStatus::Failed),
            _ => Err(PhaseParseError(s.to_string())),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_declaration_order() {
        for pair in Phase::ALL.windows(2) {
            assert!(pair[0].index() < pair[1].index(), "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn forward_moves_only() {
        assert!(Phase::IpxeBoot.can_advance_to(Phase::ConfigDownload));
        assert!(Phase::IpxeBoot.can_advance_to(Phase::IpxeBoot));
        assert!(!Phase::ImageDownload.can_advance_to(Phase::IpxeBoot));
    }

    #[test]
    fn terminal_pair_rules() {
        assert!(Phase::Installation.can_advance_to(Phase::Failed));
        assert!(Phase::Deployed.can_advance_to(Phase::Cleaned));
        assert!(Phase::Failed.can_advance_to(Phase::Cleaned));
        assert!(!Phase::Failed.can_advance_to(Phase::Failed));
        assert!(!Phase::Failed.can_advance_to(Phase::Installation));
        assert!(!Phase::Cleaned.can_advance_to(Phase::Cleaned));
        assert!(!Phase::Cleaned.can_advance_to(Phase::Failed));
    }

    #[test]
    fn parse_accepts_dashes_and_case() {
        assert_eq!("ipxe-boot".parse::<Phase>().unwrap(), Phase::IpxeBoot);
        assert_eq!("CONFIG_DOWNLOAD".parse::<Phase>().unwrap(), Phase::ConfigDownload);
        assert!("reboot".parse::<Phase>().is_err());
    }

    #[test]
    fn node_reported_window() {
        assert!(!Phase::ServerRunning.is_node_reported());
        assert!(Phase::IpxeBoot.is_node_reported());
        assert!(Phase::Installation.is_node_reported());
        assert!(!Phase::ClusterFormation.is_node_reported());
    }

    #[test]
    fn successor_walks_the_line() {
        assert_eq!(Phase::Installation.successor(), Some(Phase::ClusterFormation));
        assert_eq!(Phase::HealthValidation.successor(), Some(Phase::Deployed));
        assert_eq!(Phase::Deployed.successor(), None);
    }

    #[test]
    fn event_status_aliases() {
        assert_eq!("success".parse::<EventStatus>().unwrap(), EventStatus::Completed);
        assert_eq!("running".parse::<EventStatus>().unwrap(), EventStatus::InProgress);
        assert!("maybe".parse::<EventStatus>().is_err());
    }
}
