//! Engine-level tunables.

use clap::Parser;

/// Errors produced by [`Config::validate`].
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    /// The election timeout must exceed the heartbeat timeout, or leaders
    /// would depose themselves between heartbeats.
    #[error("election_timeout({election_timeout}) must be > heartbeat_timeout({heartbeat_timeout})")]
    ElectionTimeoutLTHeartbeat {
        election_timeout: u64,
        heartbeat_timeout: u64,
    },

    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
}

/// Runtime configuration for one engine.
///
/// Timeouts are whole milliseconds of the monotonic clock supplied by the
/// [`Io`](crate::Io) port. The effective election timeout is re-drawn from
/// `[election_timeout, 2 * election_timeout)` on every role change that
/// resets the timer.
#[derive(Debug, Clone, Parser)]
#[derive(PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Base election timeout in milliseconds.
    #[clap(long, default_value = "1000")]
    pub election_timeout: u64,

    /// Interval in milliseconds at which a leader contacts idle followers.
    #[clap(long, default_value = "100")]
    pub heartbeat_timeout: u64,

    /// Take a snapshot once this many entries were applied since the last
    /// one.
    #[clap(long, default_value = "1024")]
    pub snapshot_threshold: u64,

    /// Entries to retain in the in-memory log after a snapshot, so slightly
    /// lagging followers can still be served from the log.
    #[clap(long, default_value = "100")]
    pub snapshot_trailing: u64,

    /// Catch-up rounds granted to a server being promoted to voter.
    #[clap(long, default_value = "10")]
    pub max_catch_up_rounds: u32,

    /// Overall time budget for a promotion catch-up, in milliseconds.
    #[clap(long, default_value = "30000")]
    pub max_catch_up_duration: u64,
}

impl Default for Config {
    fn default() -> Self {
        // A bare argv yields the defaults declared above.
        <Self as Parser>::parse_from(["raft-core"])
    }
}

impl Config {
    /// Check cross-field constraints, consuming and returning the config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout == 0 {
            return Err(ConfigError::MustBePositive {
                field: "election_timeout",
            });
        }
        if self.heartbeat_timeout == 0 {
            return Err(ConfigError::MustBePositive {
                field: "heartbeat_timeout",
            });
        }
        if self.election_timeout <= self.heartbeat_timeout {
            return Err(ConfigError::ElectionTimeoutLTHeartbeat {
                election_timeout: self.election_timeout,
                heartbeat_timeout: self.heartbeat_timeout,
            });
        }
        if self.max_catch_up_rounds == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_catch_up_rounds",
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default().validate().unwrap();
        assert_eq!(1000, config.election_timeout);
        assert_eq!(100, config.heartbeat_timeout);
        assert_eq!(100, config.snapshot_trailing);
    }

    #[test]
    fn election_timeout_must_exceed_heartbeat() {
        let config = Config {
            election_timeout: 100,
            heartbeat_timeout: 100,
            ..Config::default()
        };
        assert_eq!(
            Err(ConfigError::ElectionTimeoutLTHeartbeat {
                election_timeout: 100,
                heartbeat_timeout: 100,
            }),
            config.validate()
        );
    }

    #[test]
    fn zero_timeouts_rejected() {
        let config = Config {
            election_timeout: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_args() {
        let config = Config::parse_from(["raft", "--election-timeout", "500", "--heartbeat-timeout", "50"]);
        assert_eq!(500, config.election_timeout);
        assert_eq!(50, config.heartbeat_timeout);
    }
}
