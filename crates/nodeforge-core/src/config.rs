//! nodeforge.toml configuration parser.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nodeforge_state::{AddressRole, ClusterRole, Phase};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::range::AddressRange;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub ranges: Vec<AddressRange>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ServerProfile>,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub timeouts: PhaseTimeouts,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub health: HealthProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL nodes use to reach the boot endpoints.
    pub public_base_url: String,
    pub data_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub orphan_sweep_interval_secs: u64,
    pub orphan_age_threshold_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("/var/lib/nodeforge"),
            poll_interval_secs: 15,
            orphan_sweep_interval_secs: 3600,
            orphan_age_threshold_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Rest,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub token: Option<String>,
    pub region: String,
    /// Boot image the server is created from.
    pub image: String,
    /// Security groups applied to every network attachment.
    pub security_groups: Vec<String>,
    /// Upper bound for a single provider call, retries excluded.
    pub call_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Simulated,
            endpoint: "http://127.0.0.1:9000/v1".to_string(),
            token: None,
            region: "region-1".to_string(),
            image: "ipxe-chainload".to_string(),
            security_groups: vec!["hci-default".to_string()],
            call_timeout_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Provider zone ID records are created in.
    pub zone: String,
    /// Domain suffix appended to every record name.
    pub domain: String,
    pub ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            zone: "default".to_string(),
            domain: "nodeforge.local".to_string(),
            ttl: 300,
        }
    }
}

/// Disk layout and NIC count of a server class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub description: Option<String>,
    pub boot_disk: String,
    #[serde(default)]
    pub data_disks: Vec<String>,
    #[serde(default = "default_nic_count")]
    pub nic_count: u8,
    /// Cluster roles this profile may be provisioned as.
    #[serde(default = "all_cluster_roles")]
    pub roles: Vec<ClusterRole>,
}

fn default_nic_count() -> u8 {
    2
}

fn all_cluster_roles() -> Vec<ClusterRole> {
    vec![
        ClusterRole::Compute,
        ClusterRole::Storage,
        ClusterRole::ComputeStorage,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub kernel_url: String,
    pub initrd_url: String,
    pub image_url: String,
    pub installer_version: String,
    pub foundation_image: String,
    pub hypervisor_image: String,
    /// Extra kernel arguments appended after the generated ones.
    pub kernel_args: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            kernel_url: "http://127.0.0.1:8080/images/vmlinuz".to_string(),
            initrd_url: "http://127.0.0.1:8080/images/initrd.img".to_string(),
            image_url: "http://127.0.0.1:8080/images/squashfs.img".to_string(),
            installer_version: "1.0.0".to_string(),
            foundation_image: "foundation.tar".to_string(),
            hypervisor_image: "hypervisor.iso".to_string(),
            kernel_args: Vec::new(),
        }
    }
}

/// Per-phase timeout overrides in seconds, keyed by phase name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseTimeouts(pub BTreeMap<String, u64>);

impl PhaseTimeouts {
    /// Built-in timeout for each phase. Settled phases have none, and
    /// neither has `cluster_formation`: the cluster coordinator bounds it
    /// with `[cluster] formation_timeout_secs` and never rolls nodes back.
    pub fn default_secs(phase: Phase) -> Option<u64> {
        let secs = match phase {
            Phase::Pending => 15 * 60,
            Phase::ServerRequested => 15 * 60,
            Phase::ServerProvisioning => 60 * 60,
            Phase::ServerRunning => 20 * 60,
            Phase::IpxeBoot => 15 * 60,
            Phase::ConfigDownload => 15 * 60,
            Phase::FoundationStart => 30 * 60,
            Phase::StorageDiscovery => 20 * 60,
            Phase::ImageDownload => 60 * 60,
            Phase::Installation => 2 * 60 * 60,
            Phase::DnsRegistration => 10 * 60,
            Phase::HealthValidation => 15 * 60,
            Phase::ClusterFormation | Phase::Deployed | Phase::Failed | Phase::Cleaned => {
                return None;
            }
        };
        Some(secs)
    }

    /// Configured timeout for `phase`, falling back to the default. An
    /// override for `cluster_formation` is ignored.
    pub fn get(&self, phase: Phase) -> Option<Duration> {
        if phase.is_settled() || phase == Phase::ClusterFormation {
            return None;
        }
        self.0
            .iter()
            .find(|(key, _)| key.parse::<Phase>().ok() == Some(phase))
            .map(|(_, secs)| *secs)
            .or_else(|| Self::default_secs(phase))
            .map(Duration::from_secs)
    }

    pub fn set(&mut self, phase: Phase, secs: u64) {
        self.0.insert(phase.as_str().to_string(), secs);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Roll back a node whose phase timer expires.
    pub rollback_on_phase_timeout: bool,
    /// Roll back a node that reports an installation failure itself.
    pub rollback_on_install_failure: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rollback_on_phase_timeout: true,
            rollback_on_install_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub min_members: u32,
    pub formation_timeout_secs: u64,
    pub health_poll_interval_secs: u64,
    /// Port of the management API on each node's controller VM.
    pub management_port: u16,
    pub rollback_members_on_failure: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_members: 3,
            formation_timeout_secs: 60 * 60,
            health_poll_interval_secs: 30,
            management_port: 9440,
            rollback_members_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbeConfig {
    pub port: u16,
    pub path: String,
    pub timeout_secs: u64,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            port: 9440,
            path: "/api/health".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ForgeConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ForgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for range in &self.ranges {
            range.validate()?;
            if !seen.insert(range.role) {
                return Err(ConfigError::DuplicateRange(range.role.to_string()));
            }
        }

        for profile in self.profiles.values() {
            for cluster_role in &profile.roles {
                for role in cluster_role.address_roles() {
                    if !seen.contains(role) {
                        return Err(ConfigError::MissingRange(role.to_string()));
                    }
                }
            }
        }

        for key in self.timeouts.0.keys() {
            key.parse::<Phase>()
                .map_err(|_| ConfigError::UnknownPhase(key.clone()))?;
        }

        if self.cluster.min_members == 0 {
            return Err(ConfigError::Invalid {
                key: "cluster.min_members".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "provider.retry.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider.kind == ProviderKind::Rest && self.provider.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "provider.endpoint".to_string(),
                reason: "required for the rest provider".to_string(),
            });
        }
        Ok(())
    }

    pub fn range_for(&self, role: AddressRole) -> Option<&AddressRange> {
        self.ranges.iter().find(|r| r.role == role)
    }

    pub fn profile(&self, name: &str) -> Option<&ServerProfile> {
        self.profiles.get(name)
    }

    pub fn timeout_for(&self, phase: Phase) -> Option<Duration> {
        self.timeouts.get(phase)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.call_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.service.poll_interval_secs)
    }

    pub fn orphan_age_threshold(&self) -> Duration {
        Duration::from_secs(self.service.orphan_age_threshold_secs)
    }

    /// Fully qualified DNS name for a label in the managed domain.
    pub fn fqdn(&self, label: &str) -> String {
        format!("{label}.{}", self.dns.domain)
    }

    /// A small but complete configuration for tests and dry runs:
    /// simulated provider, one range per role and a single profile.
    pub fn sample() -> Self {
        let range = |role, subnet: &str, first: &str, last: &str, gateway: &str| AddressRange {
            role,
            subnet: subnet.to_string(),
            first: first.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
            last: last.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
            prefix: 24,
            gateway: gateway.parse().ok(),
        };

        let mut profiles = BTreeMap::new();
        profiles.insert(
            "bx2d-metal-96x384".to_string(),
            ServerProfile {
                description: Some("96 vCPU, 384 GiB, 8x NVMe".to_string()),
                boot_disk: "/dev/sda".to_string(),
                data_disks: (0..8).map(|i| format!("/dev/nvme{i}n1")).collect(),
                nic_count: 2,
                roles: all_cluster_roles(),
            },
        );

        ForgeConfig {
            ranges: vec![
                range(AddressRole::Management, "subnet-mgmt", "10.10.0.10", "10.10.0.99", "10.10.0.1"),
                range(AddressRole::Hypervisor, "subnet-hv", "10.10.1.10", "10.10.1.99", "10.10.1.1"),
                range(AddressRole::ControllerVm, "subnet-cvm", "10.10.2.10", "10.10.2.99", "10.10.2.1"),
                range(AddressRole::Workload, "subnet-wl", "10.10.3.10", "10.10.3.99", "10.10.3.1"),
                range(AddressRole::ClusterVip, "subnet-cvm", "10.10.2.200", "10.10.2.220", "10.10.2.1"),
            ],
            profiles,
            ..ForgeConfig::default()
        }
    }
}
