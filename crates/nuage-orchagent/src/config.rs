//! Agent configuration.
//!
//! The agent reads one YAML document; every field has a default so an empty
//! file is a valid configuration. Managers never read this struct directly:
//! each gets its own `*Config` value derived from it at construction time.
//!
//! ```yaml
//! cms_id: 2a3b-cms
//! default_net_partition: default
//! flow_logging_enabled: false
//! stats_collection_enabled: true
//! priority: { min: 0, max: 1000000000, attempts: 3 }
//! dualstack_retry: { retries: 25, delay_ms: 200 }
//! vsd:
//!   server: https://vsd.example.net:8443
//!   base_uri: /nuage/api/v6
//!   organization: csp
//!   authorization: "XREST ..."
//!   timeout_secs: 30
//! ```

use crate::policy::PolicyGroupConfig;
use crate::port::PortLifecycleConfig;
use crate::subnet::SubnetLifecycleConfig;
use nuage_orch_common::RetryPolicy;
use nuage_vsd::HttpClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Bounds of the random ACL entry priority draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub min: u32,
    pub max: u32,
    /// Draws per entry before giving up on priority collisions.
    pub attempts: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 1_000_000_000,
            attempts: 3,
        }
    }
}

/// Retry of subnet creation while the other half of a dual-stack pair is
/// not visible yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualstackRetryConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay_ms: u64,
}

impl Default for DualstackRetryConfig {
    fn default() -> Self {
        Self {
            retries: 25,
            delay_ms: 200,
        }
    }
}

impl DualstackRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries.saturating_add(1), Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Suffix of every external id written to the VSD.
    pub cms_id: String,
    /// Net partition used by subnets that do not name one.
    pub default_net_partition: Option<String>,
    pub flow_logging_enabled: bool,
    pub stats_collection_enabled: bool,
    pub priority: PriorityConfig,
    pub dualstack_retry: DualstackRetryConfig,
    pub vsd: HttpClientConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cms_id: "openstack".to_string(),
            default_net_partition: None,
            flow_logging_enabled: false,
            stats_collection_enabled: false,
            priority: PriorityConfig::default(),
            dualstack_retry: DualstackRetryConfig::default(),
            vsd: HttpClientConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = if raw.trim().is_empty() {
            AgentConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cms_id.trim().is_empty() {
            return Err(ConfigError::Invalid("cms_id must not be empty".to_string()));
        }
        if self.priority.min > self.priority.max {
            return Err(ConfigError::Invalid(format!(
                "priority.min ({}) is above priority.max ({})",
                self.priority.min, self.priority.max
            )));
        }
        if self.priority.attempts == 0 {
            return Err(ConfigError::Invalid("priority.attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn policy_group_config(&self) -> PolicyGroupConfig {
        PolicyGroupConfig {
            cms_id: self.cms_id.clone(),
            flow_logging_enabled: self.flow_logging_enabled,
            stats_collection_enabled: self.stats_collection_enabled,
            priority: self.priority,
        }
    }

    pub fn subnet_config(&self) -> SubnetLifecycleConfig {
        SubnetLifecycleConfig {
            cms_id: self.cms_id.clone(),
            default_net_partition: self.default_net_partition.clone(),
            dualstack_retry: self.dualstack_retry.policy(),
        }
    }

    pub fn port_config(&self) -> PortLifecycleConfig {
        PortLifecycleConfig {
            cms_id: self.cms_id.clone(),
        }
    }
}
