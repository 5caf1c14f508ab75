//! Configuration options for the contract gateway.

use std::time::Duration;

use alloy::transports::http::reqwest::Url;
use clap::Parser;

use crate::types::common::Address;

/// Parse a human-readable duration such as `5s` or `30m`.
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Configuration for connecting to the deployed token and staking contracts.
#[derive(Clone, Debug, Parser)]
pub struct ChainOptions {
    /// HTTP JSON-RPC providers, in order of preference.
    ///
    /// If more than one is given, the client fails over to the next provider when the current one
    /// keeps failing.
    #[clap(
        long = "rpc-url",
        env = "CICCA_STAKING_RPC_URL",
        value_delimiter = ',',
        num_args = 1..,
        required = true
    )]
    pub http_providers: Vec<Url>,

    /// Address of the deployed CICCA token contract.
    #[clap(long, env = "CICCA_STAKING_TOKEN_ADDRESS")]
    pub token_address: Address,

    /// Address of the deployed staking contract.
    #[clap(long, env = "CICCA_STAKING_STAKING_ADDRESS")]
    pub staking_address: Address,

    /// Number of blocks a transaction must be buried under before it counts as confirmed.
    #[clap(long, env = "CICCA_STAKING_CONFIRMATIONS", default_value = "1")]
    pub confirmations: u64,

    /// Give up waiting for a transaction to be confirmed after this long.
    ///
    /// If not set, the client waits indefinitely.
    #[clap(
        long,
        env = "CICCA_STAKING_CONFIRMATION_TIMEOUT",
        value_parser = parse_duration,
    )]
    pub confirmation_timeout: Option<Duration>,

    /// Delay when retrying failed RPC requests.
    #[clap(
        long,
        env = "CICCA_STAKING_RPC_RETRY_DELAY",
        default_value = "1s",
        value_parser = parse_duration,
    )]
    pub rpc_retry_delay: Duration,

    /// Fail over to another provider if the current provider fails twice within this window.
    #[clap(
        long,
        env = "CICCA_STAKING_RPC_FREQUENT_FAILURE_TOLERANCE",
        default_value = "1m",
        value_parser = parse_duration,
    )]
    pub rpc_frequent_failure_tolerance: Duration,

    /// Fail over to another provider if the current provider fails many times in a row.
    #[clap(
        long,
        env = "CICCA_STAKING_RPC_CONSECUTIVE_FAILURE_TOLERANCE",
        default_value = "10"
    )]
    pub rpc_consecutive_failure_tolerance: usize,

    /// Revert back to the first provider this duration after failing over.
    #[clap(
        long,
        env = "CICCA_STAKING_RPC_FAILOVER_REVERT",
        default_value = "30m",
        value_parser = parse_duration,
    )]
    pub rpc_failover_revert: Duration,

    /// Amount of time to wait after receiving a 429 response before making more RPC requests.
    ///
    /// If not set, the general rpc-retry-delay will be used.
    #[clap(
        long,
        env = "CICCA_STAKING_RPC_RATE_LIMIT_DELAY",
        value_parser = parse_duration,
    )]
    pub rpc_rate_limit_delay: Option<Duration>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            http_providers: Vec::new(),
            token_address: Address::ZERO,
            staking_address: Address::ZERO,
            confirmations: 1,
            confirmation_timeout: None,
            rpc_retry_delay: Duration::from_secs(1),
            rpc_frequent_failure_tolerance: Duration::from_secs(60),
            rpc_consecutive_failure_tolerance: 10,
            rpc_failover_revert: Duration::from_secs(1800),
            rpc_rate_limit_delay: None,
        }
    }
}

impl ChainOptions {
    pub(super) fn rate_limit_delay(&self) -> Duration {
        self.rpc_rate_limit_delay.unwrap_or(self.rpc_retry_delay)
    }
}
