//! Admission policies and the registry that resolves them.
//!
//! A policy is a `(limit, block duration)` pair. The registry holds one
//! policy for anonymous (IP) traffic, one default for tokens, and any number
//! of named token tiers. It is built once at startup and never mutated.
//!
//! Tier labels are case-insensitive. They are stored lowercased, the same
//! form the layered configuration loader gives map keys from YAML and the
//! environment, and requests are matched after lowercasing their label.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RateLimitingConfig;
use crate::error::{GatekeeperError, Result};

/// A policy as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Requests allowed before the subject is blocked
    pub limit: u64,
    /// How long the block lasts, in seconds
    pub block_duration_secs: u64,
}

impl PolicyRule {
    /// Create a new rule.
    pub const fn new(limit: u64, block_duration_secs: u64) -> Self {
        Self {
            limit,
            block_duration_secs,
        }
    }
}

/// A standalone file of named tier rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierRules {
    /// Map of tier label to its rule
    #[serde(default)]
    pub tiers: HashMap<String, PolicyRule>,
}

impl TierRules {
    /// Load tier rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load tier rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse tier rules: {}", e)))
    }
}

/// A validated, immutable admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Requests allowed before the subject is blocked
    pub limit: u64,
    /// How long the block lasts once the limit is crossed
    pub block_duration: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero limit or a zero block duration.
    pub fn new(limit: u64, block_duration: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GatekeeperError::Config(
                "policy limit must be greater than zero".to_string(),
            ));
        }
        if block_duration.is_zero() {
            return Err(GatekeeperError::Config(
                "policy block duration must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            limit,
            block_duration,
        })
    }
}

impl TryFrom<PolicyRule> for Policy {
    type Error = GatekeeperError;

    fn try_from(rule: PolicyRule) -> Result<Self> {
        Policy::new(rule.limit, Duration::from_secs(rule.block_duration_secs))
    }
}

/// How a subject is classified for policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectClass<'a> {
    /// Anonymous traffic keyed by source address
    Anonymous,
    /// A token with no recognised tier
    TokenDefault,
    /// A token carrying a tier label
    Tier(&'a str),
}

impl<'a> SubjectClass<'a> {
    /// Classify a tier label; the empty label means anonymous traffic.
    pub fn from_label(label: &'a str) -> Self {
        if label.is_empty() {
            SubjectClass::Anonymous
        } else {
            SubjectClass::Tier(label)
        }
    }
}

/// Lookup table from subject class to policy.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    anonymous: Policy,
    token_default: Policy,
    tiers: HashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Create a registry with no named tiers.
    pub fn new(anonymous: Policy, token_default: Policy) -> Self {
        Self {
            anonymous,
            token_default,
            tiers: HashMap::new(),
        }
    }

    /// Add (or replace) a named tier.
    pub fn with_tier(mut self, label: impl AsRef<str>, policy: Policy) -> Self {
        self.tiers.insert(label.as_ref().to_ascii_lowercase(), policy);
        self
    }

    /// Build the registry from configuration.
    ///
    /// Tiers from `tiers_path` are loaded first; tiers declared inline in the
    /// configuration override file entries with the same label.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let mut registry = Self::new(config.ip.try_into()?, config.token.try_into()?);

        if let Some(ref path) = config.tiers_path {
            for (label, rule) in TierRules::from_file(path)?.tiers {
                registry.tiers.insert(label.to_ascii_lowercase(), rule.try_into()?);
            }
        }

        for (label, rule) in &config.tiers {
            let label = label.to_ascii_lowercase();
            if registry.tiers.contains_key(&label) {
                warn!(tier = %label, "Inline tier overrides tier from rules file");
            }
            registry.tiers.insert(label, (*rule).try_into()?);
        }

        info!(
            ip_limit = registry.anonymous.limit,
            token_limit = registry.token_default.limit,
            tiers = registry.tiers.len(),
            "Policy registry built"
        );

        Ok(registry)
    }

    /// Resolve the policy for a subject class.
    ///
    /// Unknown tier labels fall back to the token default, never to another tier.
    pub fn resolve(&self, class: SubjectClass<'_>) -> &Policy {
        match class {
            SubjectClass::Anonymous => &self.anonymous,
            SubjectClass::TokenDefault => &self.token_default,
            SubjectClass::Tier(label) => self.tier(label).unwrap_or(&self.token_default),
        }
    }

    fn tier(&self, label: &str) -> Option<&Policy> {
        if label.bytes().any(|b| b.is_ascii_uppercase()) {
            self.tiers.get(&label.to_ascii_lowercase())
        } else {
            self.tiers.get(label)
        }
    }

    /// Resolve the policy for a raw tier label.
    pub fn for_label(&self, label: &str) -> &Policy {
        self.resolve(SubjectClass::from_label(label))
    }

    /// Get the configured tier labels.
    pub fn tier_labels(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }
}
