//! Configuration for Lexicon
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::rate_limit::{RateLimit, RateLimits};
use crate::resolver::ResolverConfig;
use crate::service::ServiceConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Lexicon - term resolution and entry cache
///
/// "Seek and ye shall find" - Matthew 7:7
#[derive(Parser, Debug, Clone)]
#[command(name = "lexicon")]
#[command(about = "Term resolution and generated entry cache")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// SQLite database file; omit for an in-memory store (dev mode)
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// Enable trigram similarity matching on the store
    #[arg(long, env = "TRIGRAM_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub trigram_enabled: bool,

    /// Minimum trigram similarity for a fuzzy match
    #[arg(long, env = "SIMILARITY_THRESHOLD", default_value = "0.3")]
    pub similarity_threshold: f64,

    /// Listing size when the request gives none
    #[arg(long, env = "DEFAULT_LIMIT", default_value = "10")]
    pub default_limit: usize,

    /// Upper bound on listing size
    #[arg(long, env = "MAX_LIMIT", default_value = "50")]
    pub max_limit: usize,

    /// Comma-separated proxy IPs whose X-Forwarded-For header is trusted
    #[arg(long, env = "TRUSTED_PROXIES", value_delimiter = ',')]
    pub trusted_proxies: Vec<IpAddr>,

    /// Content synthesizer base URL (POST <url>/synthesize)
    #[arg(long, env = "SYNTHESIZER_URL")]
    pub synthesizer_url: Option<String>,

    /// Bearer token for the synthesizer
    #[arg(long, env = "SYNTHESIZER_TOKEN")]
    pub synthesizer_token: Option<String>,

    /// Hard timeout for one synthesis, in milliseconds
    #[arg(long, env = "SYNTHESIZER_TIMEOUT_MS", default_value = "20000")]
    pub synthesizer_timeout_ms: u64,

    /// Lookup rate limit per client, as max/window_seconds
    #[arg(long, env = "RATE_LIMIT_SEARCH", default_value = "60/60")]
    pub rate_limit_search: RateLimit,

    /// Generation rate limit per client, as max/window_seconds
    #[arg(long, env = "RATE_LIMIT_GENERATE", default_value = "5/60")]
    pub rate_limit_generate: RateLimit,

    /// Suggestion rate limit per client, as max/window_seconds
    #[arg(long, env = "RATE_LIMIT_SUGGEST", default_value = "120/60")]
    pub rate_limit_suggest: RateLimit,

    /// TOML file overriding guard blocklists and allow-lists
    #[arg(long, env = "GUARD_POLICY_PATH")]
    pub guard_policy_path: Option<PathBuf>,

    /// JSONL usage log destination
    #[arg(long, env = "USAGE_LOG_PATH")]
    pub usage_log_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err("SIMILARITY_THRESHOLD must be in (0, 1]".to_string());
        }

        if self.default_limit == 0 || self.max_limit == 0 {
            return Err("DEFAULT_LIMIT and MAX_LIMIT must be positive".to_string());
        }

        if self.default_limit > self.max_limit {
            return Err("DEFAULT_LIMIT must be less than or equal to MAX_LIMIT".to_string());
        }

        if self.synthesizer_timeout_ms == 0 {
            return Err("SYNTHESIZER_TIMEOUT_MS must be positive".to_string());
        }

        Ok(())
    }

    pub fn synthesizer_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesizer_timeout_ms)
    }

    /// Service settings derived from the arguments
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            resolver: ResolverConfig {
                threshold: self.similarity_threshold,
            },
            coordinator: CoordinatorConfig {
                synth_timeout: self.synthesizer_timeout(),
                ..Default::default()
            },
            rate_limits: RateLimits {
                search: self.rate_limit_search,
                generate: self.rate_limit_generate,
                suggest: self.rate_limit_suggest,
            },
            default_limit: self.default_limit,
            max_limit: self.max_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["lexicon"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_rate_limits_parse_from_flags() {
        let args = parse(&["--rate-limit-generate", "2/30", "--similarity-threshold", "0.5"]);
        let config = args.service_config();

        assert_eq!(config.rate_limits.generate, RateLimit::new(2, 30));
        assert_eq!(config.resolver.threshold, 0.5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--similarity-threshold", "1.5"]).validate().is_err());
        assert!(parse(&["--similarity-threshold", "0"]).validate().is_err());
        assert!(parse(&["--default-limit", "60", "--max-limit", "50"]).validate().is_err());
        assert!(parse(&["--synthesizer-timeout-ms", "0"]).validate().is_err());
        assert!(parse(&["--max-limit", "0"]).validate().is_err());
    }

    #[test]
    fn test_trusted_proxies() {
        assert!(parse(&[]).trusted_proxies.is_empty());

        let args = parse(&["--trusted-proxies", "10.0.0.5,::1"]);
        assert_eq!(
            args.trusted_proxies,
            vec!["10.0.0.5".parse::<IpAddr>().unwrap(), "::1".parse::<IpAddr>().unwrap()]
        );

        assert!(Args::try_parse_from(["lexicon", "--trusted-proxies", "proxy.local"]).is_err());
    }

    #[test]
    fn test_invalid_rate_limit_is_a_parse_error() {
        assert!(Args::try_parse_from(["lexicon", "--rate-limit-search", "sixty"]).is_err());
    }
}
