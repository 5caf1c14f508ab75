//! Prometheus metrics for the staking session.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::{
    Error, Result,
    error::ResultExt,
    types::{common::TokenAmount, session::SessionSnapshot},
    units::wei_to_ether,
};

/// Prometheus metrics for the staking session.
#[derive(Clone, Debug)]
pub struct SessionMetrics {
    registry: Registry,

    /// 1 while a write is in flight.
    pub is_loading: Gauge,
    /// Amount staked by the current account, in whole tokens.
    pub staked_amount: Gauge,
    /// Reward the current account could withdraw now, in whole tokens.
    pub reward_available: Gauge,
    /// Token balance of the current account, in whole tokens.
    pub token_balance: Gauge,
    /// Allowance of the staking contract over the current account's tokens, in whole tokens.
    pub allowance: Gauge,

    /// Writes by operation and outcome.
    pub writes: IntCounterVec,
    /// Failed or timed out contract reads.
    pub read_failures: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))
        .context(|| Error::internal().context(format!("creating {name} gauge")))?;
    registry
        .register(Box::new(gauge.clone()))
        .context(|| Error::internal().context(format!("registering {name} gauge")))?;
    Ok(gauge)
}

/// Whole-token value of a wei amount, for gauges.
fn tokens(amount: TokenAmount) -> f64 {
    wei_to_ether(Some(amount)).parse().unwrap_or_default()
}

impl SessionMetrics {
    /// Create a new metrics instance with everything registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let is_loading = gauge(&registry, "is_loading", "1 while a write is in flight")?;
        let staked_amount = gauge(
            &registry,
            "staked_amount",
            "Tokens staked by the current account",
        )?;
        let reward_available = gauge(
            &registry,
            "reward_available",
            "Reward the current account could withdraw now",
        )?;
        let token_balance = gauge(
            &registry,
            "token_balance",
            "Token balance of the current account",
        )?;
        let allowance = gauge(
            &registry,
            "allowance",
            "Allowance of the staking contract over the current account's tokens",
        )?;

        let writes = IntCounterVec::new(
            Opts::new("writes", "Write transactions by operation and outcome"),
            &["operation", "outcome"],
        )
        .context(|| Error::internal().context("creating writes counter"))?;
        registry
            .register(Box::new(writes.clone()))
            .context(|| Error::internal().context("registering writes counter"))?;

        let read_failures = IntCounter::with_opts(Opts::new(
            "read_failures",
            "Contract reads that failed or timed out",
        ))
        .context(|| Error::internal().context("creating read_failures counter"))?;
        registry
            .register(Box::new(read_failures.clone()))
            .context(|| Error::internal().context("registering read_failures counter"))?;

        Ok(Self {
            registry,
            is_loading,
            staked_amount,
            reward_available,
            token_balance,
            allowance,
            writes,
            read_failures,
        })
    }

    /// Bring the gauges in line with a newly published snapshot.
    pub fn observe(&self, snapshot: &SessionSnapshot) {
        self.is_loading.set(if snapshot.is_loading { 1. } else { 0. });
        let details = &snapshot.stake_details;
        self.staked_amount.set(tokens(details.staked_amount));
        self.reward_available
            .set(tokens(details.reward_available_now));
        self.token_balance.set(tokens(details.token_balance));
        self.allowance
            .set(tokens(snapshot.user_allowance.approved_wei));
    }

    /// Count a finished write.
    pub fn record_write(&self, operation: &str, ok: bool) {
        let outcome = if ok { "success" } else { "failure" };
        self.writes.with_label_values(&[operation, outcome]).inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder
            .encode(&metric_families, &mut buffer)
            .context(|| Error::internal().context("encoding metrics"))?;
        String::from_utf8(buffer)
            .context(|| Error::internal().context("metrics output is not valid UTF-8"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::common::AllowanceState;

    #[test]
    fn test_export() {
        let metrics = SessionMetrics::new().unwrap();
        let mut snapshot = SessionSnapshot {
            is_loading: true,
            user_allowance: AllowanceState::from_wei(
                TokenAmount::from(10u64).pow(TokenAmount::from(20u64)),
            ),
            ..Default::default()
        };
        snapshot.stake_details.staked_amount =
            TokenAmount::from(150u64) * TokenAmount::from(10u64).pow(TokenAmount::from(18u64));
        metrics.observe(&snapshot);
        metrics.record_write("stake", true);
        metrics.record_write("stake", false);
        metrics.read_failures.inc();

        assert_eq!(metrics.is_loading.get(), 1.);
        assert_eq!(metrics.staked_amount.get(), 150.);
        assert_eq!(metrics.allowance.get(), 100.);

        let text = metrics.export().unwrap();
        assert!(text.contains("staked_amount 150"), "{text}");
        assert!(
            text.contains(r#"writes{operation="stake",outcome="failure"} 1"#),
            "{text}"
        );
        assert!(text.contains("read_failures 1"), "{text}");
    }
}
