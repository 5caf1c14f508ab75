#![cfg(any(test, feature = "testing"))]

use std::{collections::HashMap, sync::Arc};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{ContractGateway, StakingContract, SubmittedTx, TokenContract};
use crate::{
    Error, Result,
    error::ensure,
    types::common::{Address, StakeRecord, Timestamp, TokenAmount, TxHash},
    wallet::testing::MockWallet,
};

/// How long a stake is locked for in the mock staking contract.
pub const MOCK_LOCK_PERIOD: Timestamp = 30 * 24 * 60 * 60;

/// An in-memory token and staking contract pair.
///
/// Contract handles are bound to the [`MockWallet`]'s active account at the time they are created.
/// Transactions take effect when they are confirmed, so tests can observe the session while a
/// transaction is pending by holding confirmations.
#[derive(Clone, Debug)]
pub struct MockGateway {
    chain: Arc<Mutex<MockChain>>,
    wallet: MockWallet,
    token_address: Address,
    staking_address: Address,
}

#[derive(Debug, Default)]
struct MockChain {
    balances: HashMap<Address, TokenAmount>,
    allowances: HashMap<(Address, Address), TokenAmount>,
    stakes: HashMap<Address, StakeRecord>,
    rewards: HashMap<Address, TokenAmount>,
    now: Timestamp,
    transactions: u64,
    submitted: Vec<&'static str>,
    reads: usize,
    fail_next_write: Option<Error>,
    revert_next_write: bool,
    read_failure: Option<Error>,
    read_gate: Option<Arc<Semaphore>>,
    confirmation_gate: Option<Arc<Semaphore>>,
}

/// Wait on a gate, if there is one. A closed gate lets everyone through.
async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire_owned().await {
            permit.forget();
        }
    }
}

fn open(gate: &mut Option<Arc<Semaphore>>) {
    if let Some(gate) = gate.take() {
        gate.close();
    }
}

impl MockGateway {
    pub fn new(wallet: MockWallet) -> Self {
        Self {
            chain: Arc::new(Mutex::new(MockChain {
                now: 1_700_000_000,
                ..Default::default()
            })),
            wallet,
            token_address: Address::repeat_byte(0x70),
            staking_address: Address::repeat_byte(0x57),
        }
    }

    /// Credit `account` with `amount` tokens.
    pub fn mint(&self, account: Address, amount: TokenAmount) {
        *self.chain.lock().balances.entry(account).or_default() += amount;
    }

    /// Set the staking contract's allowance over `owner`'s tokens behind the session's back.
    pub fn set_allowance(&self, owner: Address, amount: TokenAmount) {
        let spender = self.staking_address;
        self.chain.lock().allowances.insert((owner, spender), amount);
    }

    /// Set the reward `account` could withdraw right now.
    pub fn set_reward(&self, account: Address, amount: TokenAmount) {
        self.chain.lock().rewards.insert(account, amount);
    }

    pub fn balance(&self, account: Address) -> TokenAmount {
        self.chain.lock().balance(account)
    }

    pub fn allowance(&self, owner: Address) -> TokenAmount {
        self.chain.lock().allowance(owner, self.staking_address)
    }

    pub fn stake_of(&self, account: Address) -> StakeRecord {
        self.chain.lock().stake(account)
    }

    /// Operations submitted so far, in order.
    pub fn submitted(&self) -> Vec<&'static str> {
        self.chain.lock().submitted.clone()
    }

    /// Number of contract reads started so far.
    pub fn reads(&self) -> usize {
        self.chain.lock().reads
    }

    /// Reject the next transaction at submission with `err`.
    pub fn fail_next_write(&self, err: Error) {
        self.chain.lock().fail_next_write = Some(err);
    }

    /// Let the next transaction be submitted, but revert it on chain.
    pub fn revert_next_write(&self) {
        self.chain.lock().revert_next_write = true;
    }

    /// Fail every read with `err` until cleared with [`None`].
    pub fn fail_reads(&self, err: Option<Error>) {
        self.chain.lock().read_failure = err;
    }

    /// Block all reads until they are released.
    pub fn pause_reads(&self) {
        self.chain.lock().read_gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` blocked (or future) reads through a paused gate.
    pub fn release_reads(&self, n: usize) {
        if let Some(gate) = &self.chain.lock().read_gate {
            gate.add_permits(n);
        }
    }

    /// Unblock all reads.
    pub fn resume_reads(&self) {
        open(&mut self.chain.lock().read_gate);
    }

    /// Keep submitted transactions pending until confirmations are released.
    pub fn hold_confirmations(&self) {
        self.chain.lock().confirmation_gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Confirm all pending and future transactions.
    pub fn release_confirmations(&self) {
        open(&mut self.chain.lock().confirmation_gate);
    }

    fn signer(&self) -> Result<Address> {
        self.wallet
            .active_account()
            .ok_or_else(|| Error::provider_unavailable().context("no authorized account"))
    }
}

impl MockChain {
    fn balance(&self, account: Address) -> TokenAmount {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn allowance(&self, owner: Address, spender: Address) -> TokenAmount {
        self.allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    fn stake(&self, account: Address) -> StakeRecord {
        self.stakes.get(&account).copied().unwrap_or_default()
    }
}

/// A contract handle bound to a signer, shared by both mock contracts.
#[derive(Clone, Debug)]
pub struct MockHandle {
    chain: Arc<Mutex<MockChain>>,
    signer: Address,
    staking_address: Address,
}

impl MockHandle {
    /// Answer a read with the state at the time it was made, delivered once the read gate allows.
    async fn read<T: Send>(&self, f: impl Send + FnOnce(&MockChain) -> T) -> Result<T> {
        let (res, gate) = {
            let mut chain = self.chain.lock();
            chain.reads += 1;
            let res = match &chain.read_failure {
                Some(err) => Err(err.clone()),
                None => Ok(f(&chain)),
            };
            (res, chain.read_gate.clone())
        };
        pass(gate).await;
        res
    }

    fn submit(
        &self,
        op: &'static str,
        apply: impl Send + 'static + FnOnce(&mut MockChain, Address) -> Result<()>,
    ) -> Result<SubmittedTx> {
        let mut chain = self.chain.lock();
        if let Some(err) = chain.fail_next_write.take() {
            return Err(err.context(op));
        }
        chain.transactions += 1;
        chain.submitted.push(op);
        let hash = TxHash::left_padding_from(&chain.transactions.to_be_bytes());
        let revert = std::mem::take(&mut chain.revert_next_write);
        let gate = chain.confirmation_gate.clone();
        drop(chain);

        let ledger = self.chain.clone();
        let signer = self.signer;
        let confirmation = async move {
            pass(gate).await;
            ensure!(
                !revert,
                Error::transaction_failed().context(format!("{op} {hash} reverted"))
            );
            let mut chain = ledger.lock();
            chain.now += 1;
            apply(&mut chain, signer)
                .map_err(|err| err.context(format!("{op} {hash} reverted")))
        }
        .boxed();
        Ok(SubmittedTx::new(hash, confirmation))
    }
}

impl TokenContract for MockHandle {
    async fn balance_of(&self, owner: Address) -> Result<TokenAmount> {
        self.read(|chain| chain.balance(owner)).await
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<TokenAmount> {
        self.read(|chain| chain.allowance(owner, spender)).await
    }

    async fn approve(&self, spender: Address, amount: TokenAmount) -> Result<SubmittedTx> {
        self.submit("approve", move |chain, signer| {
            chain.allowances.insert((signer, spender), amount);
            Ok(())
        })
    }
}

impl StakingContract for MockHandle {
    async fn get_details(&self, user: Address) -> Result<StakeRecord> {
        self.read(|chain| chain.stake(user)).await
    }

    async fn calculate_reward(&self, user: Address) -> Result<TokenAmount> {
        self.read(|chain| chain.rewards.get(&user).copied().unwrap_or_default())
            .await
    }

    async fn stake(&self, amount: TokenAmount) -> Result<SubmittedTx> {
        let staking = self.staking_address;
        self.submit("stake", move |chain, signer| {
            ensure!(
                !amount.is_zero(),
                Error::transaction_failed().context("cannot stake 0")
            );
            let allowance = chain.allowance(signer, staking);
            ensure!(
                allowance >= amount,
                Error::transaction_failed().context("insufficient allowance")
            );
            let balance = chain.balance(signer);
            ensure!(
                balance >= amount,
                Error::transaction_failed().context("insufficient balance")
            );

            chain.balances.insert(signer, balance - amount);
            if allowance != TokenAmount::MAX {
                chain.allowances.insert((signer, staking), allowance - amount);
            }
            let now = chain.now;
            let stake = chain.stakes.entry(signer).or_default();
            stake.amount += amount;
            stake.start_time = now;
            stake.end_time = now + MOCK_LOCK_PERIOD;
            Ok(())
        })
    }

    async fn unstake(&self) -> Result<SubmittedTx> {
        self.submit("unstake", |chain, signer| {
            let stake = chain.stake(signer);
            ensure!(
                !stake.amount.is_zero(),
                Error::transaction_failed().context("nothing staked")
            );
            *chain.balances.entry(signer).or_default() += stake.amount;
            let record = chain.stakes.entry(signer).or_default();
            record.amount = TokenAmount::ZERO;
            record.start_time = 0;
            record.end_time = 0;
            Ok(())
        })
    }

    async fn withdraw_reward(&self) -> Result<SubmittedTx> {
        self.submit("withdrawReward", |chain, signer| {
            let reward = chain.rewards.remove(&signer).unwrap_or_default();
            ensure!(
                !reward.is_zero(),
                Error::transaction_failed().context("no reward to withdraw")
            );
            *chain.balances.entry(signer).or_default() += reward;
            let record = chain.stakes.entry(signer).or_default();
            record.reward_taken += reward;
            record.claimed += reward;
            Ok(())
        })
    }
}

impl ContractGateway for MockGateway {
    type Token = MockHandle;
    type Staking = MockHandle;

    fn staking_address(&self) -> Address {
        self.staking_address
    }

    fn token_contract(&self) -> Result<MockHandle> {
        Ok(MockHandle {
            chain: self.chain.clone(),
            signer: self.signer()?,
            staking_address: self.staking_address,
        })
    }

    fn staking_contract(&self) -> Result<MockHandle> {
        self.token_contract()
    }
}
