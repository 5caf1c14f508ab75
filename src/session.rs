//! The staking session state machine.
//!
//! A [`StakingSession`] owns the published [`SessionSnapshot`] and is the only thing that changes
//! it, apart from account switches made through its [`AccountSession`]. Presentation code
//! subscribes to the snapshot and issues commands; it never mutates state directly.
//!
//! Writes and background refreshes are kept apart by the snapshot's [`TransactionPhase`]: a write
//! claims the session with an atomic `Idle -> Submitting` transition and gives it back with a single
//! publish that returns to `Idle`. A read remembers the account and write generation it started
//! under and its result is dropped if either has moved on by the time it completes.

use std::{future::Future, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use tokio::sync::watch;

use crate::{
    Error, Result,
    chain::{ContractGateway, StakingContract, TokenContract, options::parse_duration},
    error::ensure,
    metrics::SessionMetrics,
    types::{
        common::{Address, AllowanceState, StakeDetails, TokenAmount, TxHash},
        session::{SessionSnapshot, SharedState, TransactionPhase},
    },
    units::{ether_to_wei, wei_to_ether},
    wallet::{AccountSession, WalletProvider},
};

/// How much to approve when the user asks to approve a stake amount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ApprovalMode {
    /// Approve the maximum possible allowance, so that one approval covers every future stake.
    #[default]
    Unlimited,
    /// Approve exactly the requested amount.
    Exact,
}

/// Which capabilities the session offers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SessionMode {
    /// Track the connected account only.
    WalletOnly,
    /// Track the account and read its staking state, but never send transactions.
    ReadOnly,
    /// Everything.
    #[default]
    Full,
}

impl SessionMode {
    fn reads_enabled(self) -> bool {
        !matches!(self, Self::WalletOnly)
    }

    fn writes_enabled(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Parse a human token amount such as `100` or `0.5`.
fn parse_token_amount(s: &str) -> Result<TokenAmount> {
    ether_to_wei(Some(s))
}

/// Configuration for a [`StakingSession`].
#[derive(Clone, Debug, Parser)]
pub struct SessionOptions {
    /// How often to refresh allowance and stake details in the background.
    #[clap(
        long,
        env = "CICCA_STAKING_POLL_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub poll_interval: Duration,

    /// Give up on a contract read after this long.
    #[clap(
        long,
        env = "CICCA_STAKING_READ_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration,
    )]
    pub read_timeout: Duration,

    /// How much allowance to grant the staking contract when approving.
    #[clap(long, env = "CICCA_STAKING_APPROVAL", value_enum, default_value_t)]
    pub approval: ApprovalMode,

    /// Capabilities of the session.
    #[clap(long, env = "CICCA_STAKING_MODE", value_enum, default_value_t)]
    pub mode: SessionMode,

    /// Do not read the account's token balance along with its stake.
    #[clap(long, env = "CICCA_STAKING_SKIP_BALANCE")]
    pub skip_balance: bool,

    /// Smallest amount that may be staked at once, in whole tokens.
    #[clap(long, env = "CICCA_STAKING_MIN_STAKE", value_parser = parse_token_amount)]
    pub min_stake: Option<TokenAmount>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            approval: ApprovalMode::default(),
            mode: SessionMode::default(),
            skip_balance: false,
            min_stake: None,
        }
    }
}

#[derive(Clone, Copy, Debug, derive_more::Display)]
enum WriteCall {
    #[display("approve")]
    Approve(TokenAmount),
    #[display("stake")]
    Stake(TokenAmount),
    #[display("unstake")]
    Unstake,
    #[display("withdraw_reward")]
    WithdrawReward,
}

impl WriteCall {
    fn refreshes_allowance(&self) -> bool {
        matches!(self, Self::Approve(_) | Self::Stake(_))
    }

    fn refreshes_details(&self) -> bool {
        !matches!(self, Self::Approve(_))
    }
}

/// The conditions under which a read's result may still be published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Guard {
    /// Only while no write is in flight, and only if none started since the read did.
    Idle,
    /// Whatever the phase, unless a write started or published since the read did.
    Unchanged,
    /// The follow-up read of a write, which owns the session.
    Write,
}

#[derive(Clone, Copy, Debug)]
struct Ticket {
    account: Address,
    generation: u64,
    guard: Guard,
}

impl Ticket {
    fn valid(&self, s: &SessionSnapshot) -> bool {
        if s.current_account != Some(self.account) {
            return false;
        }
        match self.guard {
            Guard::Idle => s.allow_refresh() && s.generation == self.generation,
            Guard::Unchanged => s.generation == self.generation,
            Guard::Write => true,
        }
    }
}

/// The staking session for one wallet.
#[derive(Debug)]
pub struct StakingSession<G, W> {
    gateway: G,
    account: Arc<AccountSession<W>>,
    state: SharedState,
    opt: SessionOptions,
    metrics: SessionMetrics,
}

impl<G: ContractGateway, W: WalletProvider> StakingSession<G, W> {
    pub fn new(gateway: G, wallet: W, opt: SessionOptions) -> Result<Self> {
        let state = Arc::new(watch::Sender::new(SessionSnapshot::default()));
        let metrics = SessionMetrics::new()?;
        Ok(Self {
            gateway,
            account: Arc::new(AccountSession::new(wallet, state.clone(), metrics.clone())),
            state,
            opt,
            metrics,
        })
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn account(&self) -> &Arc<AccountSession<W>> {
        &self.account
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opt
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// See [`AccountSession::check_wallet_connected`].
    pub async fn check_wallet_connected(&self) -> Option<Address> {
        self.account.check_wallet_connected().await
    }

    /// See [`AccountSession::connect_wallet`].
    pub async fn connect_wallet(&self) -> Result<Address> {
        self.account.connect_wallet().await
    }

    /// See [`AccountSession::observe`].
    pub fn observe_accounts(&self) -> Result<()>
    where
        W: 'static,
    {
        self.account.observe()
    }

    fn publish(&self, f: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        self.account.publish(f)
    }

    /// Re-read allowance and stake details for the current account, unless a write is in flight.
    ///
    /// This is what the refresh scheduler runs on every tick.
    pub async fn refresh(&self) -> Result<()> {
        if !self.opt.mode.reads_enabled() {
            return Ok(());
        }
        let Some(account) = self.state.borrow().current_account else {
            return Ok(());
        };
        if let Some(ticket) = self.ticket(account, Guard::Idle) {
            self.read_allowance(ticket).await?;
        }
        if let Some(ticket) = self.ticket(account, Guard::Idle) {
            self.read_details(ticket).await?;
        }
        Ok(())
    }

    /// Read the stake details of `account`.
    ///
    /// Does nothing while a write is in flight. Results are only published if `account` is still
    /// the current account when the read completes.
    pub async fn fetch_stake_details(&self, account: Address) -> Result<()> {
        ensure!(
            self.opt.mode.reads_enabled(),
            Error::unsupported().context("stake details are disabled in wallet-only mode")
        );
        match self.ticket(account, Guard::Idle) {
            Some(ticket) => self.read_details(ticket).await,
            None => Ok(()),
        }
    }

    /// Read the staking contract's allowance over `account`'s tokens.
    ///
    /// Unlike [`fetch_stake_details`](Self::fetch_stake_details) this runs even while a write is in
    /// flight, but a result that a write has overtaken is still discarded.
    pub async fn fetch_allowance(&self, account: Address) -> Result<()> {
        ensure!(
            self.opt.mode.reads_enabled(),
            Error::unsupported().context("allowance is disabled in wallet-only mode")
        );
        match self.ticket(account, Guard::Unchanged) {
            Some(ticket) => self.read_allowance(ticket).await,
            None => Ok(()),
        }
    }

    fn ticket(&self, account: Address, guard: Guard) -> Option<Ticket> {
        let s = self.state.borrow();
        if guard == Guard::Idle && !s.allow_refresh() {
            tracing::debug!(phase = ?s.phase, "write in flight, skipping read");
            return None;
        }
        Some(Ticket {
            account,
            generation: s.generation,
            guard,
        })
    }

    async fn bounded<T>(&self, what: &str, read: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.opt.read_timeout, read).await {
            Ok(res) => res,
            Err(_) => Err(Error::read_failed().context(format!(
                "{what} timed out after {}",
                humantime::format_duration(self.opt.read_timeout)
            ))),
        }
    }

    async fn read_allowance(&self, ticket: Ticket) -> Result<()> {
        let spender = self.gateway.staking_address();
        let res = self
            .bounded("allowance", async {
                self.gateway
                    .token_contract()?
                    .allowance(ticket.account, spender)
                    .await
            })
            .await;
        match res {
            Ok(wei) => {
                let allowance = AllowanceState::from_wei(wei);
                self.publish_read(ticket, |s| {
                    if s.user_allowance == allowance {
                        return false;
                    }
                    s.user_allowance = allowance;
                    true
                });
                Ok(())
            }
            Err(err) => Err(self.read_failed(ticket, err)),
        }
    }

    async fn read_details(&self, ticket: Ticket) -> Result<()> {
        let account = ticket.account;
        let res = self
            .bounded("stake details", async {
                let staking = self.gateway.staking_contract()?;
                let token = if self.opt.skip_balance {
                    None
                } else {
                    Some(self.gateway.token_contract()?)
                };
                let balance = async {
                    match &token {
                        Some(token) => token.balance_of(account).await.map(Some),
                        None => Ok(None),
                    }
                };
                let (record, reward, balance) = tokio::try_join!(
                    staking.get_details(account),
                    staking.calculate_reward(account),
                    balance,
                )?;
                Ok::<_, Error>(StakeDetails::loaded(record, reward, balance))
            })
            .await;
        match res {
            Ok(details) => {
                self.publish_read(ticket, |s| {
                    if s.stake_details == details {
                        return false;
                    }
                    s.stake_details = details;
                    true
                });
                Ok(())
            }
            Err(err) => Err(self.read_failed(ticket, err)),
        }
    }

    /// Publish a successful read if its ticket is still valid, clearing any read error.
    fn publish_read(&self, ticket: Ticket, update: impl FnOnce(&mut SessionSnapshot) -> bool) {
        let published = self.publish(|s| {
            if !ticket.valid(s) {
                return false;
            }
            let mut changed = update(s) | s.read_error.take().is_some();
            if ticket.guard == Guard::Write {
                // Overtake any read that started before this result was known.
                s.generation += 1;
                changed = true;
            }
            changed
        });
        if !published && self.state.borrow().current_account != Some(ticket.account) {
            tracing::debug!(account = %ticket.account, "discarding read for previous account");
        }
    }

    fn read_failed(&self, ticket: Ticket, err: Error) -> Error {
        self.metrics.read_failures.inc();
        err.log("read");
        self.publish(|s| {
            if !ticket.valid(s) {
                return false;
            }
            s.read_error = Some(err.clone());
            true
        });
        err
    }

    /// Approve the staking contract to spend the user's tokens.
    ///
    /// `amount` is in whole tokens. Depending on [`ApprovalMode`] either exactly this amount or an
    /// unlimited allowance is approved.
    #[tracing::instrument(skip(self))]
    pub async fn approve_stake_amount(&self, amount: &str) -> Result<TxHash> {
        let wei = match ether_to_wei(Some(amount)) {
            Ok(wei) => wei,
            Err(err) => return self.reject("approve", err),
        };
        let approval = match self.opt.approval {
            ApprovalMode::Unlimited => TokenAmount::MAX,
            ApprovalMode::Exact => wei,
        };
        self.write(WriteCall::Approve(approval)).await
    }

    /// Stake `amount` whole tokens.
    #[tracing::instrument(skip(self))]
    pub async fn stake_cicca_amount(&self, amount: &str) -> Result<TxHash> {
        let wei = match self.stake_amount(amount) {
            Ok(wei) => wei,
            Err(err) => return self.reject("stake", err),
        };
        self.write(WriteCall::Stake(wei)).await
    }

    fn stake_amount(&self, amount: &str) -> Result<TokenAmount> {
        let wei = ether_to_wei(Some(amount))?;
        ensure!(
            !wei.is_zero(),
            Error::bad_request().context("cannot stake 0 tokens")
        );
        if let Some(min) = self.opt.min_stake {
            ensure!(
                wei >= min,
                Error::bad_request().context(format!(
                    "stake of {amount} is below the minimum of {}",
                    wei_to_ether(Some(min))
                ))
            );
        }
        Ok(wei)
    }

    /// Withdraw the entire stake.
    #[tracing::instrument(skip(self))]
    pub async fn unstake_amount(&self) -> Result<TxHash> {
        self.write(WriteCall::Unstake).await
    }

    /// Withdraw the accrued reward.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw_reward(&self) -> Result<TxHash> {
        self.write(WriteCall::WithdrawReward).await
    }

    /// Fail a command without touching the write path.
    fn reject<T>(&self, op: &str, err: Error) -> Result<T> {
        err.log(op);
        self.publish(|s| {
            if s.last_error.as_ref() == Some(&err) {
                return false;
            }
            s.last_error = Some(err.clone());
            true
        });
        Err(err)
    }

    async fn write(&self, call: WriteCall) -> Result<TxHash> {
        let op = call.to_string();
        if !self.opt.mode.writes_enabled() {
            return self.reject(
                &op,
                Error::unsupported().context(format!("{op} is disabled in {:?} mode", self.opt.mode)),
            );
        }
        let account = match self.begin_write(&op) {
            Ok(account) => account,
            Err(err) => return self.reject(&op, err),
        };

        let res = self.run_write(call, account).await;
        self.metrics.record_write(&op, res.is_ok());
        match &res {
            Ok(hash) => {
                tracing::info!(%hash, op, "write complete");
                self.finish_write(None);
            }
            Err(err) => {
                err.log(&op);
                self.publish(|s| {
                    s.phase = TransactionPhase::Failed;
                    true
                });
                self.finish_write(Some(err.clone()));
            }
        }
        res
    }

    /// Claim the session for a write.
    fn begin_write(&self, op: &str) -> Result<Address> {
        let mut res = Err(Error::internal());
        self.publish(|s| {
            let Some(account) = s.current_account else {
                res = Err(Error::provider_unavailable().context("no wallet account connected"));
                return false;
            };
            if s.phase != TransactionPhase::Idle {
                res = Err(Error::busy().context(format!(
                    "cannot {op} while another transaction is {:?}",
                    s.phase
                )));
                return false;
            }
            s.phase = TransactionPhase::Submitting;
            s.is_loading = true;
            s.generation += 1;
            res = Ok(account);
            true
        });
        res
    }

    async fn run_write(&self, call: WriteCall, account: Address) -> Result<TxHash> {
        let tx = match call {
            WriteCall::Approve(amount) => {
                self.gateway
                    .token_contract()?
                    .approve(self.gateway.staking_address(), amount)
                    .await?
            }
            WriteCall::Stake(amount) => self.gateway.staking_contract()?.stake(amount).await?,
            WriteCall::Unstake => self.gateway.staking_contract()?.unstake().await?,
            WriteCall::WithdrawReward => {
                self.gateway.staking_contract()?.withdraw_reward().await?
            }
        };
        let hash = tx.hash();
        self.publish(|s| {
            s.phase = TransactionPhase::Confirming;
            true
        });
        tracing::info!(%hash, "waiting for confirmation");
        tx.confirmed().await?;

        self.publish(|s| {
            s.phase = TransactionPhase::Refreshing;
            if call.refreshes_details() {
                s.stake_details.is_loading = true;
            }
            true
        });
        // The transaction is on chain now. A failed refresh is left in `read_error` for the next
        // poll to repair; it does not make the write itself a failure.
        if let Err(err) = self.refresh_after_write(call, account).await {
            tracing::warn!(%hash, %err, "transaction confirmed but reading the new state failed");
        }
        Ok(hash)
    }

    async fn refresh_after_write(&self, call: WriteCall, account: Address) -> Result<()> {
        let ticket = Ticket {
            account,
            generation: 0,
            guard: Guard::Write,
        };
        if call.refreshes_allowance() {
            self.read_allowance(ticket).await?;
        }
        if call.refreshes_details() {
            self.read_details(ticket).await?;
        }
        Ok(())
    }

    /// Give the session back, re-enabling background refreshes and write controls at once.
    fn finish_write(&self, err: Option<Error>) {
        self.publish(|s| {
            s.phase = TransactionPhase::Idle;
            s.is_loading = false;
            s.generation += 1;
            s.last_error = err;
            true
        });
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        chain::testing::MockGateway, error::ErrorKind, types::common::StakeRecord,
        wallet::testing::MockWallet,
    };

    type Session = StakingSession<MockGateway, MockWallet>;

    fn alice() -> Address {
        "0xABC0000000000000000000000000000000000ABC".parse().unwrap()
    }

    fn bob() -> Address {
        Address::repeat_byte(0xB0)
    }

    fn tokens(s: &str) -> TokenAmount {
        ether_to_wei(Some(s)).unwrap()
    }

    async fn setup(opt: SessionOptions) -> (Arc<Session>, MockGateway, MockWallet) {
        let wallet = MockWallet::new([alice(), bob()]);
        let gateway = MockGateway::new(wallet.clone());
        gateway.mint(alice(), tokens("1000"));
        let session = Arc::new(StakingSession::new(gateway.clone(), wallet.clone(), opt).unwrap());
        session.connect_wallet().await.unwrap();
        (session, gateway, wallet)
    }

    async fn wait_for_phase(session: &Session, phase: TransactionPhase) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.phase == phase))
            .await
            .unwrap()
            .unwrap();
    }

    async fn eventually(mut f: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if f() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[test_log::test(tokio::test)]
    async fn test_approve_then_stake() {
        let (session, gateway, _) = setup(Default::default()).await;
        session.refresh().await.unwrap();

        let snapshot = session.snapshot();
        assert!(snapshot.user_allowance.needs_approval());
        assert_eq!(snapshot.user_allowance.approved_ether_amount, "0");
        assert!(!snapshot.stake_details.is_loading);
        assert_eq!(snapshot.stake_details.token_balance, tokens("1000"));

        session.approve_stake_amount("150").await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.user_allowance.approved_wei, TokenAmount::MAX);
        assert_eq!(
            snapshot.user_allowance.approved_ether_amount,
            wei_to_ether(Some(TokenAmount::MAX))
        );
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.phase, TransactionPhase::Idle);

        session.stake_cicca_amount("50").await.unwrap();
        assert_eq!(session.snapshot().stake_details.staked_amount, tokens("50"));
        session.stake_cicca_amount("25.5").await.unwrap();

        let details = session.snapshot().stake_details;
        assert!(!details.is_loading);
        assert_eq!(details.staked_amount, tokens("75.5"));
        assert_eq!(details.token_balance, tokens("924.5"));
        assert_eq!(details.display().staked_amount, "75.5");
        assert_eq!(gateway.stake_of(alice()).amount, tokens("75.5"));
        assert_eq!(gateway.submitted(), ["approve", "stake", "stake"]);

        let metrics = session.metrics().export().unwrap();
        assert!(
            metrics.contains(r#"writes{operation="stake",outcome="success"} 2"#),
            "{metrics}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_exact_approval() {
        let (session, gateway, _) = setup(SessionOptions {
            approval: ApprovalMode::Exact,
            ..Default::default()
        })
        .await;

        session.approve_stake_amount("150").await.unwrap();
        assert_eq!(gateway.allowance(alice()), tokens("150"));
        assert_eq!(
            session.snapshot().user_allowance.approved_ether_amount,
            "150"
        );

        // Staking consumes the exact allowance.
        session.stake_cicca_amount("100").await.unwrap();
        assert_eq!(session.snapshot().user_allowance.approved_wei, tokens("50"));

        // More than is approved reverts on chain.
        let err = session.stake_cicca_amount("60").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionFailed);
        assert_eq!(session.snapshot().stake_details.staked_amount, tokens("100"));
    }

    #[test_log::test(tokio::test)]
    async fn test_allowance_read_is_idempotent() {
        let (session, gateway, _) = setup(Default::default()).await;
        session.approve_stake_amount("1").await.unwrap();

        session.fetch_allowance(alice()).await.unwrap();
        let first = session.snapshot().user_allowance;
        session.fetch_allowance(alice()).await.unwrap();
        assert_eq!(session.snapshot().user_allowance, first);
        assert_eq!(gateway.submitted(), ["approve"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_write_phases_and_busy() {
        let (session, gateway, _) = setup(Default::default()).await;
        session.approve_stake_amount("1000").await.unwrap();
        session.refresh().await.unwrap();

        gateway.hold_confirmations();
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.stake_cicca_amount("100").await }
        });
        wait_for_phase(&session, TransactionPhase::Confirming).await;

        let snapshot = session.snapshot();
        assert!(snapshot.is_loading);
        assert!(!snapshot.allow_refresh());

        // A second write is refused without touching the one in flight.
        let err = session.stake_cicca_amount("50").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(gateway.submitted(), ["approve", "stake"]);
        assert_eq!(session.snapshot().phase, TransactionPhase::Confirming);

        // Background refreshes are suppressed.
        let reads = gateway.reads();
        session.refresh().await.unwrap();
        session.fetch_stake_details(alice()).await.unwrap();
        assert_eq!(gateway.reads(), reads);

        gateway.release_confirmations();
        task.await.unwrap().unwrap();

        let snapshot = session.snapshot();
        assert!(!snapshot.is_loading);
        assert!(snapshot.allow_refresh());
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.stake_details.staked_amount, tokens("100"));
    }

    #[test_log::test(tokio::test)]
    async fn test_poll_started_before_write_is_discarded() {
        let (session, gateway, _) = setup(Default::default()).await;
        gateway.set_reward(alice(), tokens("3"));
        session.refresh().await.unwrap();
        assert!(session.snapshot().user_allowance.needs_approval());

        // Someone else changes the allowance; a poll picks it up but is slow to answer.
        gateway.set_allowance(alice(), tokens("10"));
        gateway.pause_reads();
        let reads = gateway.reads();
        let poll = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });
        eventually(|| gateway.reads() > reads).await;

        // A write starts while the poll is outstanding.
        gateway.hold_confirmations();
        let write = tokio::spawn({
            let session = session.clone();
            async move { session.withdraw_reward().await }
        });
        wait_for_phase(&session, TransactionPhase::Confirming).await;

        // The poll's answer arrives mid-write and must not land.
        gateway.release_reads(1);
        poll.await.unwrap().unwrap();
        assert!(session.snapshot().user_allowance.needs_approval());

        gateway.resume_reads();
        gateway.release_confirmations();
        write.await.unwrap().unwrap();
        let snapshot = session.snapshot();
        assert!(snapshot.user_allowance.needs_approval());
        assert_eq!(snapshot.stake_details.reward_available_now, TokenAmount::ZERO);
        assert_eq!(snapshot.stake_details.claimed, tokens("3"));

        // The next poll sees it.
        session.refresh().await.unwrap();
        assert_eq!(session.snapshot().user_allowance.approved_wei, tokens("10"));
    }

    #[test_log::test(tokio::test)]
    async fn test_rejected_write_rolls_back() {
        let (session, gateway, _) = setup(Default::default()).await;
        session.approve_stake_amount("1").await.unwrap();
        session.stake_cicca_amount("10").await.unwrap();
        let before = session.snapshot();

        gateway.fail_next_write(Error::user_rejected());
        let err = session.stake_cicca_amount("10").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserRejected);

        let after = session.snapshot();
        assert!(!after.is_loading);
        assert!(after.allow_refresh());
        assert_eq!(after.stake_details, before.stake_details);
        assert_eq!(after.user_allowance, before.user_allowance);
        assert_eq!(after.last_error, Some(err));

        // A reverted transaction is handled the same way.
        gateway.revert_next_write();
        let err = session.unstake_amount().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionFailed);
        let after = session.snapshot();
        assert!(!after.is_loading);
        assert_eq!(after.stake_details, before.stake_details);
        assert_eq!(gateway.stake_of(alice()).amount, tokens("10"));

        // The next successful command clears the error.
        session.unstake_amount().await.unwrap();
        let after = session.snapshot();
        assert_eq!(after.last_error, None);
        assert_eq!(after.stake_details.staked_amount, TokenAmount::ZERO);
        assert_eq!(after.stake_details.token_balance, tokens("1000"));

        let metrics = session.metrics().export().unwrap();
        assert!(
            metrics.contains(r#"writes{operation="stake",outcome="failure"} 1"#),
            "{metrics}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_withdraw_reward() {
        let (session, gateway, _) = setup(Default::default()).await;
        gateway.set_reward(alice(), tokens("2.5"));
        session.refresh().await.unwrap();
        assert!(session.snapshot().stake_details.can_withdraw_reward());

        session.withdraw_reward().await.unwrap();
        let details = session.snapshot().stake_details;
        assert_eq!(details.reward_available_now, TokenAmount::ZERO);
        assert_eq!(details.reward_claimed_to_date, tokens("2.5"));
        assert_eq!(details.token_balance, tokens("1002.5"));
        assert!(!details.can_withdraw_reward());
    }

    #[test_log::test(tokio::test)]
    async fn test_read_failure_keeps_last_good_state() {
        let (session, gateway, _) = setup(Default::default()).await;

        gateway.fail_reads(Some(Error::read_failed().context("rpc down")));
        let err = session.refresh().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        let snapshot = session.snapshot();
        assert!(snapshot.stake_details.is_loading);
        assert_eq!(snapshot.read_error, Some(err));

        gateway.fail_reads(None);
        session.refresh().await.unwrap();
        let snapshot = session.snapshot();
        assert!(!snapshot.stake_details.is_loading);
        assert_eq!(snapshot.read_error, None);

        gateway.fail_reads(Some(Error::read_failed()));
        session.refresh().await.unwrap_err();
        let failed = session.snapshot();
        assert_eq!(failed.stake_details, snapshot.stake_details);
        assert_eq!(failed.user_allowance, snapshot.user_allowance);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_read_timeout() {
        let (session, gateway, _) = setup(SessionOptions {
            read_timeout: Duration::from_secs(3),
            ..Default::default()
        })
        .await;
        gateway.pause_reads();

        let err = session.refresh().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        assert!(err.message().contains("timed out after 3s"), "{err}");
        assert_eq!(session.snapshot().read_error, Some(err));
        assert_eq!(session.metrics().read_failures.get(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_stake_amounts() {
        let (session, gateway, _) = setup(SessionOptions {
            min_stake: Some(tokens("100")),
            ..Default::default()
        })
        .await;
        session.approve_stake_amount("1").await.unwrap();

        for amount in ["50", "0", "abc", "-5", ""] {
            let err = session.stake_cicca_amount(amount).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{amount:?}");
            assert_eq!(session.snapshot().last_error, Some(err));
        }
        assert_eq!(
            session.approve_stake_amount("1.2.3").await.unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(gateway.submitted(), ["approve"]);
        assert!(!session.snapshot().is_loading);

        session.stake_cicca_amount("100").await.unwrap();
        assert_eq!(gateway.stake_of(alice()).amount, tokens("100"));
    }

    #[test_log::test(tokio::test)]
    async fn test_capability_modes() {
        let (session, gateway, _) = setup(SessionOptions {
            mode: SessionMode::ReadOnly,
            ..Default::default()
        })
        .await;
        session.refresh().await.unwrap();
        assert!(!session.snapshot().stake_details.is_loading);
        let err = session.approve_stake_amount("1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(gateway.submitted().is_empty());

        let (session, gateway, _) = setup(SessionOptions {
            mode: SessionMode::WalletOnly,
            ..Default::default()
        })
        .await;
        session.refresh().await.unwrap();
        assert_eq!(gateway.reads(), 0);
        assert_eq!(session.snapshot().current_account, Some(alice()));
        assert_eq!(
            session.fetch_stake_details(alice()).await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            session.withdraw_reward().await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_skip_balance() {
        let (session, _, _) = setup(SessionOptions {
            skip_balance: true,
            ..Default::default()
        })
        .await;
        session.refresh().await.unwrap();
        let details = session.snapshot().stake_details;
        assert!(!details.is_loading);
        assert_eq!(details.token_balance, TokenAmount::ZERO);
    }

    #[test_log::test(tokio::test)]
    async fn test_write_without_account() {
        let wallet = MockWallet::new([alice()]);
        let gateway = MockGateway::new(wallet.clone());
        let session = StakingSession::new(gateway.clone(), wallet, Default::default()).unwrap();

        let err = session.unstake_amount().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(!session.snapshot().is_loading);
        assert_eq!(session.snapshot().phase, TransactionPhase::Idle);
        assert!(gateway.submitted().is_empty());

        // Nothing to refresh either.
        session.refresh().await.unwrap();
        assert_eq!(gateway.reads(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_account_switch_during_write() {
        let (session, gateway, wallet) = setup(Default::default()).await;
        session.approve_stake_amount("1").await.unwrap();
        session.observe_accounts().unwrap();

        gateway.hold_confirmations();
        let write = tokio::spawn({
            let session = session.clone();
            async move { session.stake_cicca_amount("10").await }
        });
        wait_for_phase(&session, TransactionPhase::Confirming).await;

        wallet.switch_accounts([bob(), alice()]);
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.current_account == Some(bob()))
            .await
            .unwrap();

        gateway.release_confirmations();
        write.await.unwrap().unwrap();

        // Alice's stake went through, but her data is not shown for Bob.
        assert_eq!(gateway.stake_of(alice()).amount, tokens("10"));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.current_account, Some(bob()));
        assert!(snapshot.stake_details.is_loading);
        assert_eq!(snapshot.stake_details.staked_amount, TokenAmount::ZERO);
        assert!(snapshot.user_allowance.needs_approval());
        assert!(!snapshot.is_loading);

        session.refresh().await.unwrap();
        let details = session.snapshot().stake_details;
        assert!(!details.is_loading);
        assert_eq!(
            StakeRecord {
                amount: details.staked_amount,
                ..Default::default()
            },
            gateway.stake_of(bob())
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_confirmed_write_survives_refresh_failure() {
        let (session, gateway, _) = setup(Default::default()).await;
        session.approve_stake_amount("1").await.unwrap();
        session.refresh().await.unwrap();

        gateway.hold_confirmations();
        let write = tokio::spawn({
            let session = session.clone();
            async move { session.stake_cicca_amount("10").await }
        });
        wait_for_phase(&session, TransactionPhase::Confirming).await;

        // The RPC goes down between submission and the follow-up reads.
        gateway.fail_reads(Some(Error::read_failed().context("rpc down")));
        gateway.release_confirmations();
        let hash = write.await.unwrap().unwrap();
        assert_eq!(hash, TxHash::left_padding_from(&2u64.to_be_bytes()));
        assert_eq!(gateway.stake_of(alice()).amount, tokens("10"));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, TransactionPhase::Idle);
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(
            snapshot.read_error.as_ref().map(Error::kind),
            Some(ErrorKind::ReadFailed)
        );
        assert!(snapshot.stake_details.is_loading);

        let metrics = session.metrics().export().unwrap();
        assert!(
            metrics.contains(r#"writes{operation="stake",outcome="success"} 1"#),
            "{metrics}"
        );
        assert!(
            !metrics.contains(r#"writes{operation="stake",outcome="failure"}"#),
            "{metrics}"
        );

        // The next poll repairs the state.
        gateway.fail_reads(None);
        session.refresh().await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.read_error, None);
        assert!(!snapshot.stake_details.is_loading);
        assert_eq!(snapshot.stake_details.staked_amount, tokens("10"));
    }

    #[test_log::test(tokio::test)]
    async fn test_writes_follow_account_switch() {
        let (session, gateway, wallet) = setup(Default::default()).await;
        gateway.mint(bob(), tokens("200"));
        session.approve_stake_amount("1").await.unwrap();
        session.stake_cicca_amount("10").await.unwrap();
        session.observe_accounts().unwrap();

        wallet.switch_accounts([bob(), alice()]);
        let mut rx = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.current_account == Some(bob())),
        )
        .await
        .unwrap()
        .unwrap();

        session.approve_stake_amount("50").await.unwrap();
        session.stake_cicca_amount("50").await.unwrap();

        // Bob signed both transactions.
        assert_eq!(gateway.allowance(bob()), TokenAmount::MAX);
        assert_eq!(gateway.stake_of(bob()).amount, tokens("50"));
        assert_eq!(gateway.balance(bob()), tokens("150"));

        // Alice's position is untouched.
        assert_eq!(gateway.stake_of(alice()).amount, tokens("10"));
        assert_eq!(gateway.balance(alice()), tokens("990"));

        let details = session.snapshot().stake_details;
        assert_eq!(details.staked_amount, tokens("50"));
        assert_eq!(details.token_balance, tokens("150"));
    }

    #[test_log::test(tokio::test)]
    async fn test_account_switch_resets_metrics() {
        let (session, _, wallet) = setup(Default::default()).await;
        session.approve_stake_amount("1").await.unwrap();
        session.stake_cicca_amount("10").await.unwrap();
        let metrics = session.metrics();
        assert_eq!(metrics.staked_amount.get(), 10.);
        assert_eq!(metrics.token_balance.get(), 990.);

        session.observe_accounts().unwrap();
        wallet.switch_accounts([bob()]);
        let mut rx = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.current_account == Some(bob())),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(metrics.staked_amount.get(), 0.);
        assert_eq!(metrics.token_balance.get(), 0.);
        assert_eq!(metrics.allowance.get(), 0.);
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_rejection_does_not_republish() {
        let (session, _, _) = setup(Default::default()).await;
        let mut rx = session.subscribe();
        rx.borrow_and_update();

        let err = session.stake_cicca_amount("0").await.unwrap_err();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(session.stake_cicca_amount("0").await.unwrap_err(), err);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(session.snapshot().last_error, Some(err));
    }

    #[test]
    fn test_parse_session_options() {
        let opt = SessionOptions::try_parse_from([
            "cicca-staking",
            "--approval",
            "exact",
            "--mode",
            "read-only",
            "--min-stake",
            "100",
            "--poll-interval",
            "2s",
        ])
        .unwrap();
        assert_eq!(opt.approval, ApprovalMode::Exact);
        assert_eq!(opt.mode, SessionMode::ReadOnly);
        assert_eq!(opt.min_stake, Some(tokens("100")));
        assert_eq!(opt.poll_interval, Duration::from_secs(2));
        assert_eq!(opt.read_timeout, Duration::from_secs(30));
        assert!(!opt.skip_balance);

        let opt = SessionOptions::try_parse_from(["cicca-staking"]).unwrap();
        assert_eq!(opt.approval, ApprovalMode::Unlimited);
        assert_eq!(opt.mode, SessionMode::Full);
        assert_eq!(opt.poll_interval, Duration::from_secs(5));
    }
}
