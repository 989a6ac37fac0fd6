//! Environment-keyed configuration. Every option is both a flag and an
//! environment variable; the env names are the service's public surface.
//! Timeouts and windows are in seconds.

use std::time::Duration;

use anyhow::bail;
use clap::Parser;

// Difficulty is hex nibbles of a SHA-256 digest.
const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 64;

#[derive(Parser, Debug, Clone)]
#[command(name = "powgate", about = "Proof-of-work gated quote service", version)]
pub struct Config {
    /// TCP port to listen on
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Per-message handling deadline
    #[arg(long, env = "READ_TIMEOUT", default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Deadline for writing one reply frame
    #[arg(long, env = "WRITE_TIMEOUT", default_value_t = 30)]
    pub write_timeout_secs: u64,

    /// How long an open connection may sit between messages
    #[arg(long, env = "IDLE_TIMEOUT", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Cap on concurrently served connections
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 100)]
    pub max_connections: usize,

    /// Messages admitted per peer within one rate window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: usize,

    /// Width of the sliding rate window
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window_secs: u64,

    /// Challenge store address
    #[arg(long, env = "REDIS_ADDR", default_value = "redis://127.0.0.1:6379")]
    pub redis_addr: String,

    /// Lifetime of an unsolved challenge
    #[arg(long, env = "CHALLENGE_TTL", default_value_t = 20)]
    pub challenge_ttl_secs: u64,

    /// Lifetime of the spent marker shadowing a consumed challenge
    #[arg(long, env = "SPENT_TTL", default_value_t = 120)]
    pub spent_ttl_secs: u64,

    /// Required count of leading hex zeros in a solution digest
    #[arg(long, env = "POW_DIFFICULTY", default_value_t = 20)]
    pub pow_difficulty: u32,

    /// Postgres connection string for the quote corpus
    #[arg(long, env = "DBSTRING")]
    pub dbstring: String,

    /// Directory holding the quote schema migrations
    #[arg(long, env = "MIGRATION_PATH", default_value = "./migrations")]
    pub migration_path: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pow_difficulty < MIN_DIFFICULTY || self.pow_difficulty > MAX_DIFFICULTY {
            bail!(
                "POW_DIFFICULTY must be between {} and {}",
                MIN_DIFFICULTY,
                MAX_DIFFICULTY
            );
        }
        if self.max_connections == 0 {
            bail!("MAX_CONNECTIONS must be positive");
        }
        if self.rate_limit == 0 {
            bail!("RATE_LIMIT must be positive");
        }
        if self.rate_window_secs == 0 {
            bail!("RATE_WINDOW must be positive");
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn spent_ttl(&self) -> Duration {
        Duration::from_secs(self.spent_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            port: 8080,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 60,
            max_connections: 100,
            rate_limit: 10,
            rate_window_secs: 60,
            redis_addr: "redis://127.0.0.1:6379".to_string(),
            challenge_ttl_secs: 20,
            spent_ttl_secs: 120,
            pow_difficulty: 20,
            dbstring: "postgres://localhost/quotes".to_string(),
            migration_path: "./migrations".to_string(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_difficulty() {
        let mut cfg = base();
        cfg.pow_difficulty = 0;
        assert!(cfg.validate().is_err());
        cfg.pow_difficulty = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_connection_cap() {
        let mut cfg = base();
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());
    }
}
