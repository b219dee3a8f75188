//! Policy decision point
//!
//! A policy is a small bitmask evaluated per local account at every send and
//! whenever a capability query arrives. Evaluation must be cheap; the engine
//! never caches the result.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use serde::Serialize;

use crate::error::ConfigError;

/// Protocol versions understood by this implementation
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ProtocolVersion {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(other),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u16())
    }
}

/// A set of protocol versions (advertised or allowed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionSet {
    v1: bool,
    v2: bool,
}

impl VersionSet {
    pub const NONE: Self = Self { v1: false, v2: false };

    pub fn with(mut self, version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V1 => self.v1 = true,
            ProtocolVersion::V2 => self.v2 = true,
        }
        self
    }

    pub fn contains(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::V1 => self.v1,
            ProtocolVersion::V2 => self.v2,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.v1 && !self.v2
    }

    pub fn intersect(&self, other: &VersionSet) -> VersionSet {
        VersionSet {
            v1: self.v1 && other.v1,
            v2: self.v2 && other.v2,
        }
    }

    /// Highest version in the set
    pub fn best(&self) -> Option<ProtocolVersion> {
        if self.v2 {
            Some(ProtocolVersion::V2)
        } else if self.v1 {
            Some(ProtocolVersion::V1)
        } else {
            None
        }
    }
}

/// Per-account capability bitmask
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Policy(u8);

impl Policy {
    pub const NEVER: Policy = Policy(0);
    pub const ALLOW_V1: Policy = Policy(0x01);
    pub const ALLOW_V2: Policy = Policy(0x02);
    /// Refuse to send plaintext; queue an AKE instead
    pub const REQUIRE_ENCRYPTION: Policy = Policy(0x04);
    /// Advertise support with whitespace tags and start the AKE when the peer does
    pub const AUTO_INITIATE: Policy = Policy(0x08);

    pub const OPPORTUNISTIC: Policy = Policy(0x01 | 0x02 | 0x08);
    pub const MANUAL: Policy = Policy(0x01 | 0x02);
    pub const ALWAYS: Policy = Policy(0x01 | 0x02 | 0x04 | 0x08);
    pub const DEFAULT: Policy = Self::OPPORTUNISTIC;

    pub fn contains(self, other: Policy) -> bool {
        self.0 & other.0 == other.0
    }

    /// Versions this policy allows
    pub fn versions(self) -> VersionSet {
        let mut set = VersionSet::NONE;
        if self.contains(Self::ALLOW_V1) {
            set = set.with(ProtocolVersion::V1);
        }
        if self.contains(Self::ALLOW_V2) {
            set = set.with(ProtocolVersion::V2);
        }
        set
    }

    pub fn requires_encryption(self) -> bool {
        self.contains(Self::REQUIRE_ENCRYPTION)
    }

    pub fn auto_initiates(self) -> bool {
        self.contains(Self::AUTO_INITIATE)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Self) -> Self::Output {
        Policy(self.0 | rhs.0)
    }
}

impl BitAnd for Policy {
    type Output = Policy;

    fn bitand(self, rhs: Self) -> Self::Output {
        Policy(self.0 & rhs.0)
    }
}

impl Not for Policy {
    type Output = Policy;

    fn not(self) -> Self::Output {
        Policy(!self.0 & 0x0f)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Policy({})", self)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "never")
        } else {
            write!(f, "{}", names.join(", "))
        }
    }
}

const FLAG_NAMES: &[(&str, Policy)] = &[
    ("allow-v1", Policy::ALLOW_V1),
    ("allow-v2", Policy::ALLOW_V2),
    ("require-encryption", Policy::REQUIRE_ENCRYPTION),
    ("auto-initiate", Policy::AUTO_INITIATE),
];

impl FromStr for Policy {
    type Err = ConfigError;

    /// Parse a comma-separated flag list, or one of the named presets
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = Policy::NEVER;
        for flag in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let flag = flag.to_lowercase();
            policy = policy
                | match flag.as_str() {
                    "never" => Policy::NEVER,
                    "manual" => Policy::MANUAL,
                    "opportunistic" | "default" => Policy::OPPORTUNISTIC,
                    "always" => Policy::ALWAYS,
                    other => FLAG_NAMES
                        .iter()
                        .find(|(name, _)| *name == other)
                        .map(|(_, flag)| *flag)
                        .ok_or_else(|| ConfigError::InvalidPolicy {
                            value: other.to_string(),
                        })?,
                };
        }
        Ok(policy)
    }
}

/// Policy evaluator consulted by the engine
pub trait PolicyEvaluator: Send + Sync {
    fn policy(&self, account: &str) -> Policy;
}

impl<F> PolicyEvaluator for F
where
    F: Fn(&str) -> Policy + Send + Sync,
{
    fn policy(&self, account: &str) -> Policy {
        self(account)
    }
}

/// Table of per-account policies with a fallback
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    accounts: HashMap<String, Policy>,
    fallback: Policy,
}

impl PolicyTable {
    pub fn new(fallback: Policy) -> Self {
        Self {
            accounts: HashMap::new(),
            fallback,
        }
    }

    pub fn set(&mut self, account: impl Into<String>, policy: Policy) {
        self.accounts.insert(account.into(), policy);
    }
}

impl PolicyEvaluator for PolicyTable {
    fn policy(&self, account: &str) -> Policy {
        self.accounts.get(account).copied().unwrap_or(self.fallback)
    }
}
