//! Primitive types.

use serde::{Deserialize, Serialize};

use crate::units::wei_to_ether;

pub use alloy::primitives::{Address, TxHash, U256};

/// An amount of CICCA tokens in wei.
pub type TokenAmount = U256;

/// A Unix timestamp in seconds since epoch.
pub type Timestamp = u64;

/// Render an address the way the session stores and displays it: `0x`-prefixed and lower-cased.
pub fn lower_hex(address: &Address) -> String {
    address.to_string().to_lowercase()
}

/// A user's position as reported by the staking contract's `getDetails`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StakeRecord {
    /// Amount currently staked, in wei.
    pub amount: TokenAmount,

    /// When the current stake started.
    pub start_time: Timestamp,

    /// When the current stake's lock ends.
    pub end_time: Timestamp,

    /// Reward already taken out of the contract.
    pub reward_taken: TokenAmount,

    /// Reward accrued but not yet withdrawn.
    pub reward_to_be_withdrawn: TokenAmount,

    /// Total reward claimed by this user.
    pub claimed: TokenAmount,
}

/// The staking state of the connected account, as last read from chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StakeDetails {
    /// True until the first read completes, and again from the moment a write's effects are
    /// pending until its follow-up read completes.
    pub is_loading: bool,

    /// Token balance of the account, in wei.
    pub token_balance: TokenAmount,

    /// Amount staked, in wei.
    pub staked_amount: TokenAmount,

    /// Stake start time.
    pub start_time: Timestamp,

    /// Stake end time.
    pub end_time: Timestamp,

    /// Reward claimed to date, in wei.
    pub reward_claimed_to_date: TokenAmount,

    /// Reward recorded as withdrawable by the contract, in wei.
    pub reward_withdrawable: TokenAmount,

    /// Total claimed, in wei.
    pub claimed: TokenAmount,

    /// Reward available right now, as computed on chain by `calculateReward`.
    ///
    /// This is never extrapolated locally; it only changes when it is re-read.
    pub reward_available_now: TokenAmount,
}

impl Default for StakeDetails {
    fn default() -> Self {
        Self {
            is_loading: true,
            token_balance: TokenAmount::ZERO,
            staked_amount: TokenAmount::ZERO,
            start_time: 0,
            end_time: 0,
            reward_claimed_to_date: TokenAmount::ZERO,
            reward_withdrawable: TokenAmount::ZERO,
            claimed: TokenAmount::ZERO,
            reward_available_now: TokenAmount::ZERO,
        }
    }
}

impl StakeDetails {
    /// Assemble a freshly loaded snapshot from contract reads.
    ///
    /// `token_balance` is [`None`] when the balance read is disabled, in which case the balance is
    /// reported as zero.
    pub fn loaded(
        record: StakeRecord,
        reward_available_now: TokenAmount,
        token_balance: Option<TokenAmount>,
    ) -> Self {
        Self {
            is_loading: false,
            token_balance: token_balance.unwrap_or_default(),
            staked_amount: record.amount,
            start_time: record.start_time,
            end_time: record.end_time,
            reward_claimed_to_date: record.reward_taken,
            reward_withdrawable: record.reward_to_be_withdrawn,
            claimed: record.claimed,
            reward_available_now,
        }
    }

    /// A human-unit view of these details for display.
    pub fn display(&self) -> StakeDetailsDisplay {
        StakeDetailsDisplay {
            is_loading: self.is_loading,
            token_balance: wei_to_ether(Some(self.token_balance)),
            staked_amount: wei_to_ether(Some(self.staked_amount)),
            start_time: self.start_time,
            end_time: self.end_time,
            reward_claimed_to_date: wei_to_ether(Some(self.reward_claimed_to_date)),
            reward_withdrawable: wei_to_ether(Some(self.reward_withdrawable)),
            claimed: wei_to_ether(Some(self.claimed)),
            reward_available_now: wei_to_ether(Some(self.reward_available_now)),
        }
    }

    /// Whether there is a stake that can be withdrawn.
    pub fn can_unstake(&self) -> bool {
        !self.is_loading && !self.staked_amount.is_zero()
    }

    /// Whether there is reward that can be claimed.
    pub fn can_withdraw_reward(&self) -> bool {
        !self.is_loading && !self.reward_available_now.is_zero()
    }
}

/// [`StakeDetails`] with every amount in whole-token decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StakeDetailsDisplay {
    pub is_loading: bool,
    pub token_balance: String,
    pub staked_amount: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub reward_claimed_to_date: String,
    pub reward_withdrawable: String,
    pub claimed: String,
    pub reward_available_now: String,
}

/// How much of the user's token the staking contract may spend.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowanceState {
    /// The allowance in whole-token units.
    pub approved_ether_amount: String,

    /// The raw allowance in wei.
    pub approved_wei: TokenAmount,
}

impl Default for AllowanceState {
    fn default() -> Self {
        Self::from_wei(TokenAmount::ZERO)
    }
}

impl AllowanceState {
    pub fn from_wei(approved_wei: TokenAmount) -> Self {
        Self {
            approved_ether_amount: wei_to_ether(Some(approved_wei)),
            approved_wei,
        }
    }

    /// An allowance of zero means an approval transaction is needed before staking.
    pub fn needs_approval(&self) -> bool {
        self.approved_wei.is_zero()
    }

    /// Whether the allowance covers staking `amount` wei.
    pub fn covers(&self, amount: TokenAmount) -> bool {
        self.approved_wei >= amount
    }
}
