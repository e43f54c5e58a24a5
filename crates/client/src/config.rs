//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tidal_core::{ArgLimits, ConfigError, MAX_NESTING, MAX_OBJECT_FIELDS};
use tidal_reactive::SettlementPolicy;

/// Default idle time before a prewarmed subscription is released.
pub const DEFAULT_PREWARM_TTL: Duration = Duration::from_secs(5);

/// Default page size for paginated queries.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Configuration for a [`Client`](crate::Client).
///
/// Deserializes from camelCase JSON. Missing fields take their defaults,
/// and `prewarmTtl` is given in milliseconds:
///
/// ```
/// use tidal_client::ClientConfig;
///
/// let config: ClientConfig =
///     serde_json::from_str(r#"{"prewarmTtl": 250, "settlementPolicy": "touchedTokens"}"#).unwrap();
/// assert_eq!(config.prewarm_ttl.as_millis(), 250);
/// assert_eq!(config.default_page_size, 10);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Idle time before a prewarmed subscription is released
    #[serde(with = "duration_ms")]
    pub prewarm_ttl: Duration,
    /// When confirmed optimistic patches are retired
    pub settlement_policy: SettlementPolicy,
    /// Page size used by `paginate` when none is given
    pub default_page_size: usize,
    /// Maximum nesting depth of query and mutation arguments
    pub max_arg_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prewarm_ttl: DEFAULT_PREWARM_TTL,
            settlement_policy: SettlementPolicy::default(),
            default_page_size: DEFAULT_PAGE_SIZE,
            max_arg_depth: MAX_NESTING,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_page_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "defaultPageSize",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_arg_depth == 0 || self.max_arg_depth > MAX_NESTING {
            return Err(ConfigError::InvalidField {
                field: "maxArgDepth",
                reason: format!("must be between 1 and {MAX_NESTING}"),
            });
        }
        Ok(())
    }

    /// Argument limits derived from this configuration.
    pub fn arg_limits(&self) -> ArgLimits {
        ArgLimits {
            max_depth: self.max_arg_depth,
            max_fields: MAX_OBJECT_FIELDS,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
