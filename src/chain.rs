//! Handles to the token and staking contracts.
//!
//! The session never holds on to a contract handle: it asks the [`ContractGateway`] for a fresh
//! one for every operation, so the handle is always bound to whichever account is active in the
//! wallet at that moment.

use std::future::Future;

use futures::future::BoxFuture;

use crate::{
    Result,
    types::common::{Address, StakeRecord, TokenAmount, TxHash},
};

pub mod contracts;
pub mod options;
mod switching_transport;
pub mod testing;

pub use contracts::RpcGateway;

/// A transaction which has been accepted by the network but not necessarily included yet.
#[derive(derive_more::Debug)]
pub struct SubmittedTx {
    hash: TxHash,
    #[debug("<confirmation>")]
    confirmation: BoxFuture<'static, Result<()>>,
}

impl SubmittedTx {
    /// Wrap a sent transaction with the future that resolves once it is successfully included.
    pub fn new(hash: TxHash, confirmation: BoxFuture<'static, Result<()>>) -> Self {
        Self { hash, confirmation }
    }

    /// The hash of the submitted transaction.
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Wait for the transaction to be included.
    ///
    /// Fails if the transaction reverts or is never confirmed.
    pub async fn confirmed(self) -> Result<TxHash> {
        self.confirmation.await?;
        Ok(self.hash)
    }
}

/// The subset of the ERC-20 token interface the session uses.
pub trait TokenContract: Send + Sync {
    /// The token balance of `owner`, in wei.
    fn balance_of(&self, owner: Address) -> impl Send + Future<Output = Result<TokenAmount>>;

    /// How much of `owner`'s tokens `spender` may transfer.
    fn allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> impl Send + Future<Output = Result<TokenAmount>>;

    /// Allow `spender` to transfer up to `amount` of the signer's tokens.
    fn approve(
        &self,
        spender: Address,
        amount: TokenAmount,
    ) -> impl Send + Future<Output = Result<SubmittedTx>>;
}

/// The staking contract interface.
pub trait StakingContract: Send + Sync {
    /// The current stake of `user`.
    fn get_details(&self, user: Address) -> impl Send + Future<Output = Result<StakeRecord>>;

    /// The reward `user` could withdraw right now, computed on chain.
    fn calculate_reward(&self, user: Address)
    -> impl Send + Future<Output = Result<TokenAmount>>;

    /// Stake `amount` wei of the signer's tokens.
    fn stake(&self, amount: TokenAmount) -> impl Send + Future<Output = Result<SubmittedTx>>;

    /// Withdraw the signer's entire stake.
    fn unstake(&self) -> impl Send + Future<Output = Result<SubmittedTx>>;

    /// Withdraw the signer's accrued reward.
    fn withdraw_reward(&self) -> impl Send + Future<Output = Result<SubmittedTx>>;
}

/// Factory for contract handles bound to the currently active signer.
pub trait ContractGateway: Send + Sync {
    type Token: TokenContract;
    type Staking: StakingContract;

    /// Address of the staking contract, which is the spender for token approvals.
    fn staking_address(&self) -> Address;

    /// A token contract handle bound to the current signer.
    ///
    /// Fails if no signer is available (e.g. no wallet is connected).
    fn token_contract(&self) -> Result<Self::Token>;

    /// A staking contract handle bound to the current signer.
    ///
    /// Fails if no signer is available (e.g. no wallet is connected).
    fn staking_contract(&self) -> Result<Self::Staking>;
}
