//! Background refresh of the staking session.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::Instrument;

use crate::{chain::ContractGateway, session::StakingSession, wallet::WalletProvider};

/// Periodically re-reads allowance and stake details for the connected account.
///
/// A refresh also runs as soon as the connected account changes, without waiting for the next
/// tick. Ticks that fall while a write is in flight do nothing. The timer is cancelled when the
/// scheduler is stopped or dropped.
#[derive(Debug)]
pub struct RefreshScheduler {
    task: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// Start refreshing `session` every [`poll_interval`](crate::session::SessionOptions).
    pub fn start<G, W>(session: Arc<StakingSession<G, W>>) -> Self
    where
        G: ContractGateway + 'static,
        W: WalletProvider + 'static,
    {
        let period = session.options().poll_interval;
        tracing::info!(?period, "starting refresh scheduler");
        let task = tokio::spawn(
            run(session, period).instrument(tracing::info_span!("refresh scheduler")),
        );
        Self { task: Some(task) }
    }

    /// Cancel the timer.
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("refresh scheduler stopped");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn run<G, W>(session: Arc<StakingSession<G, W>>, period: Duration)
where
    G: ContractGateway,
    W: WalletProvider,
{
    let mut snapshots = session.subscribe();
    let mut account = snapshots.borrow_and_update().current_account;
    if account.is_some() {
        refresh(&session).await;
    }

    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => refresh(&session).await,
            res = snapshots.changed() => {
                if res.is_err() {
                    break;
                }
                let current = snapshots.borrow_and_update().current_account;
                if current != account {
                    account = current;
                    if account.is_some() {
                        tracing::debug!(?account, "account changed, refreshing now");
                        refresh(&session).await;
                    }
                }
            }
        }
    }
}

async fn refresh<G, W>(session: &StakingSession<G, W>)
where
    G: ContractGateway,
    W: WalletProvider,
{
    // Failures are already logged and recorded in the snapshot.
    if let Err(err) = session.refresh().await {
        tracing::debug!(%err, "refresh failed");
    }
}
