//! Configuration module for Meridian.

use crate::error::{MeridianError, Result};
use crate::state::NodeRole;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a Meridian node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Master service configuration.
    #[serde(default)]
    pub master: MasterConfig,
    /// Cluster state publication configuration.
    #[serde(default)]
    pub publish: PublishConfig,
    /// Shard recovery configuration.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl MeridianConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeridianError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            MeridianError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            return Err(MeridianError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must not be empty".to_string(),
            });
        }

        if self.node.cluster_name.is_empty() {
            return Err(MeridianError::InvalidConfig {
                field: "node.cluster_name".to_string(),
                reason: "Cluster name must not be empty".to_string(),
            });
        }

        if self.node.roles.is_empty() {
            return Err(MeridianError::InvalidConfig {
                field: "node.roles".to_string(),
                reason: "A node needs at least one role".to_string(),
            });
        }

        if self.master.max_batch_size == 0 {
            return Err(MeridianError::InvalidConfig {
                field: "master.max_batch_size".to_string(),
                reason: "Batch size must be non-zero".to_string(),
            });
        }

        if let PublicationFailurePolicy::Retry { max_attempts: 0 } = self.master.publication_failure {
            return Err(MeridianError::InvalidConfig {
                field: "master.publication_failure.max_attempts".to_string(),
                reason: "Retry policy needs at least one attempt".to_string(),
            });
        }

        if self.publish.required_acks == QuorumPolicy::Fixed(0) {
            return Err(MeridianError::InvalidConfig {
                field: "publish.required_acks".to_string(),
                reason: "At least one acknowledgement is required".to_string(),
            });
        }

        if self.publish.timeout.is_zero() {
            return Err(MeridianError::InvalidConfig {
                field: "publish.timeout".to_string(),
                reason: "Publication timeout must be non-zero".to_string(),
            });
        }

        if self.recovery.max_concurrent_recoveries == 0 {
            return Err(MeridianError::InvalidConfig {
                field: "recovery.max_concurrent_recoveries".to_string(),
                reason: "Must allow at least one recovery".to_string(),
            });
        }

        if self.recovery.max_retries == 0 {
            return Err(MeridianError::InvalidConfig {
                field: "recovery.max_retries".to_string(),
                reason: "Each phase needs at least one attempt".to_string(),
            });
        }

        if self.recovery.chunk_size == 0 {
            return Err(MeridianError::InvalidConfig {
                field: "recovery.chunk_size".to_string(),
                reason: "Chunk size must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: "dev-node".to_string(),
                name: "dev-node".to_string(),
                address: "127.0.0.1:9300".to_string(),
                cluster_name: "meridian-dev".to_string(),
                roles: vec![NodeRole::Master, NodeRole::Data],
            },
            master: MasterConfig::default(),
            publish: PublishConfig {
                timeout: Duration::from_secs(5),
                required_acks: QuorumPolicy::Majority,
                diffs_enabled: true,
            },
            recovery: RecoveryConfig {
                phase_timeout: Duration::from_secs(10),
                retry_backoff: Duration::from_millis(100),
                ..RecoveryConfig::default()
            },
            observability: ObservabilityConfig {
                metrics_enabled: false,
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: String,
    /// Human-readable node name.
    pub name: String,
    /// Transport address advertised to other nodes.
    pub address: String,
    /// Name of the cluster this node belongs to.
    pub cluster_name: String,
    /// Roles of the node.
    pub roles: Vec<NodeRole>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            name: "meridian-node".to_string(),
            address: "127.0.0.1:9300".to_string(),
            cluster_name: "meridian".to_string(),
            roles: vec![NodeRole::Master, NodeRole::Data],
        }
    }
}

/// What the master does when a committed state misses its ack quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PublicationFailurePolicy {
    /// Fail the batch and abdicate.
    StepDown,
    /// Republish the same state with backoff, then abdicate.
    Retry { max_attempts: u32 },
}

impl Default for PublicationFailurePolicy {
    fn default() -> Self {
        PublicationFailurePolicy::StepDown
    }
}

/// Master service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Maximum number of same-topic tasks executed in one batch.
    pub max_batch_size: usize,
    /// Behaviour when publication fails.
    #[serde(default)]
    pub publication_failure: PublicationFailurePolicy,
    /// Backoff between republication attempts.
    #[serde(with = "duration_format")]
    pub republish_backoff: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            publication_failure: PublicationFailurePolicy::StepDown,
            republish_backoff: Duration::from_millis(200),
        }
    }
}

/// Number of acknowledgements a publication needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// A fixed number of nodes.
    Fixed(usize),
    /// More than half of the nodes in the published state.
    Majority,
    /// Every node in the published state.
    All,
}

impl QuorumPolicy {
    /// Required acknowledgements for a cluster of `nodes` nodes.
    pub fn required(&self, nodes: usize) -> usize {
        match self {
            QuorumPolicy::Fixed(k) => *k,
            QuorumPolicy::Majority => nodes / 2 + 1,
            QuorumPolicy::All => nodes,
        }
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Majority
    }
}

/// Publication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Time a publication round may take before it fails.
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    /// Acknowledgement quorum.
    #[serde(default)]
    pub required_acks: QuorumPolicy,
    /// Send diffs to nodes known to hold the previous version.
    pub diffs_enabled: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            required_acks: QuorumPolicy::Majority,
            diffs_enabled: true,
        }
    }
}

/// Shard recovery configuration. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recoveries running at the same time on one node.
    pub max_concurrent_recoveries: usize,
    /// Attempts per recovery phase before the session fails.
    pub max_retries: u32,
    /// Timeout of a single phase attempt.
    #[serde(with = "duration_format")]
    pub phase_timeout: Duration,
    /// Initial backoff between phase attempts.
    #[serde(with = "duration_format")]
    pub retry_backoff: Duration,
    /// Upper bound of the phase backoff.
    #[serde(with = "duration_format")]
    pub max_retry_backoff: Duration,
    /// Size of a file chunk requested from the source.
    pub chunk_size: usize,
    /// Attempts to see a mapping update acknowledged by the master.
    pub mapping_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 2,
            max_retries: 3,
            phase_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(5),
            chunk_size: 512 * 1024,
            mapping_retries: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for durations written as `<number><unit>` segments.
///
/// Units are `h`, `m`, `s` and `ms`. Segments may be chained largest first
/// (`"1h30m"`, `"1m30s"`, `"2s500ms"`). A bare number is milliseconds.
pub mod duration_format {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    const UNITS: [(&str, u64); 4] = [("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)];

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn format_duration(duration: &Duration) -> String {
        let mut rest = duration.as_millis() as u64;
        if rest == 0 {
            return "0s".to_string();
        }
        let mut out = String::new();
        for (unit, millis) in UNITS {
            let count = rest / millis;
            if count > 0 {
                out.push_str(&format!("{}{}", count, unit));
                rest %= millis;
            }
        }
        out
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<u64>().map(Duration::from_millis).map_err(|e| e.to_string());
        }

        let mut total: u64 = 0;
        // Index into UNITS of the last unit seen; segments must get smaller.
        let mut last_unit: Option<usize> = None;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(format!("expected a number in duration '{}'", s));
            }
            let count = rest[..digits].parse::<u64>().map_err(|e| e.to_string())?;
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let unit = &rest[..unit_len];
            rest = &rest[unit_len..];

            let index = UNITS
                .iter()
                .position(|(name, _)| *name == unit)
                .ok_or_else(|| format!("unknown unit '{}' in duration '{}'", unit, s))?;
            if last_unit.is_some_and(|last| index <= last) {
                return Err(format!("units out of order in duration '{}'", s));
            }
            last_unit = Some(index);

            total = count
                .checked_mul(UNITS[index].1)
                .and_then(|millis| total.checked_add(millis))
                .ok_or_else(|| format!("duration '{}' is too large", s))?;
        }
        Ok(Duration::from_millis(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MeridianConfig::default();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.publish.required_acks, QuorumPolicy::Majority);
        assert_eq!(config.master.publication_failure, PublicationFailurePolicy::StepDown);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = MeridianConfig::development();
        assert!(!config.observability.metrics_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quorum_policy() {
        assert_eq!(QuorumPolicy::Majority.required(5), 3);
        assert_eq!(QuorumPolicy::Majority.required(1), 1);
        assert_eq!(QuorumPolicy::All.required(5), 5);
        assert_eq!(QuorumPolicy::Fixed(3).required(5), 3);
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let mut config = MeridianConfig::default();
        config.recovery.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(MeridianError::InvalidConfig { ref field, .. }) if field == "recovery.max_retries"
        ));
    }

    #[test]
    fn test_parse_duration() {
        use duration_format::parse_duration;
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("75").unwrap(), Duration::from_millis(75));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_compound_duration() {
        use duration_format::parse_duration;
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h2m3s4ms").unwrap(), Duration::from_millis(3_723_004));
        assert_eq!(parse_duration(" 2s500ms ").unwrap(), Duration::from_millis(2_500));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("30s1m").is_err());
        assert!(parse_duration("1s1s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn test_durations_serialize_in_largest_units() {
        use duration_format::{format_duration, parse_duration};
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(&Duration::from_millis(200)), "200ms");
        assert_eq!(format_duration(&Duration::from_millis(3_723_004)), "1h2m3s4ms");
        assert_eq!(format_duration(&Duration::ZERO), "0s");

        let config = MeridianConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MeridianConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.publish.timeout, config.publish.timeout);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node": {{
                    "id": "node-7",
                    "name": "seven",
                    "address": "10.0.0.7:9300",
                    "cluster_name": "prod",
                    "roles": ["Data"]
                }},
                "publish": {{
                    "timeout": "2s",
                    "required_acks": {{ "fixed": 2 }},
                    "diffs_enabled": false
                }},
                "master": {{
                    "max_batch_size": 16,
                    "publication_failure": {{ "policy": "retry", "max_attempts": 3 }},
                    "republish_backoff": "50ms"
                }}
            }}"#
        )
        .unwrap();

        let config = MeridianConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.id, "node-7");
        assert_eq!(config.publish.required_acks, QuorumPolicy::Fixed(2));
        assert_eq!(config.publish.timeout, Duration::from_secs(2));
        assert_eq!(
            config.master.publication_failure,
            PublicationFailurePolicy::Retry { max_attempts: 3 }
        );
        assert_eq!(config.recovery.max_retries, 3);
    }

    #[test]
    fn test_partial_recovery_section() {
        let config: RecoveryConfig =
            serde_json::from_str(r#"{ "max_retries": 7, "retry_backoff": "1s" }"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
        assert_eq!(config.chunk_size, RecoveryConfig::default().chunk_size);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"node\": {{ \"id\": \"\", \"name\": \"x\", \"address\": \"a\", \"cluster_name\": \"c\", \"roles\": [\"Master\"] }} }}").unwrap();
        assert!(MeridianConfig::from_file(file.path()).is_err());
    }
}
