//! Contract bindings and the JSON-RPC implementation of [`ContractGateway`].

use std::time::Duration;

use alloy::{
    contract::Error as ContractError,
    network::{Ethereum, ReceiptResponse},
    providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder},
    rpc::client::RpcClient,
    sol,
    transports::RpcError,
};
use futures::FutureExt;

use super::{
    ContractGateway, StakingContract, SubmittedTx, TokenContract, options::ChainOptions,
    switching_transport::SwitchingTransport,
};
use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::{Address, StakeRecord, TokenAmount},
    wallet::WalletProvider,
};

/// EIP-1193 error code for a request the user declined in their wallet.
pub const USER_REJECTED_CODE: i64 = 4001;

sol! {
    /// The ERC-20 subset of the CICCA token used by the session.
    #[sol(rpc)]
    interface ICiccaToken {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }

    /// The CICCA staking contract.
    #[sol(rpc)]
    interface ICiccaStaking {
        struct StakeInfo {
            uint256 amount;
            uint256 startTime;
            uint256 endTime;
            uint256 rewardTaken;
            uint256 rewardToBeWithdrawn;
            uint256 claimed;
        }

        function getDetails(address user) external view returns (StakeInfo memory);
        function calculateReward(address user) external view returns (uint256);
        function stake(uint256 amount) external;
        function unstake() external;
        function withdrawReward() external;
    }
}

impl From<ICiccaStaking::StakeInfo> for StakeRecord {
    fn from(info: ICiccaStaking::StakeInfo) -> Self {
        Self {
            amount: info.amount,
            start_time: info.startTime.saturating_to(),
            end_time: info.endTime.saturating_to(),
            reward_taken: info.rewardTaken,
            reward_to_be_withdrawn: info.rewardToBeWithdrawn,
            claimed: info.claimed,
        }
    }
}

/// How long and how deep to wait for a submitted transaction.
#[derive(Clone, Copy, Debug)]
struct Confirmation {
    confirmations: u64,
    timeout: Option<Duration>,
}

impl Confirmation {
    fn watch(self, op: &'static str, pending: PendingTransactionBuilder<Ethereum>) -> SubmittedTx {
        let hash = *pending.tx_hash();
        tracing::info!(%hash, op, "transaction submitted");
        let confirmation = async move {
            let receipt = pending
                .with_required_confirmations(self.confirmations)
                .with_timeout(self.timeout)
                .get_receipt()
                .await
                .context(|| Error::transaction_failed().context(format!("{op} {hash}")))?;
            ensure!(
                receipt.status(),
                Error::transaction_failed().context(format!("{op} {hash} reverted"))
            );
            tracing::info!(%hash, op, block = ?receipt.block_number(), "transaction confirmed");
            Ok(())
        }
        .boxed();
        SubmittedTx::new(hash, confirmation)
    }
}

/// Classify an error from sending a transaction.
fn write_error(op: &str, err: ContractError) -> Error {
    let base = match &err {
        ContractError::TransportError(RpcError::ErrorResp(payload))
            if payload.code == USER_REJECTED_CODE =>
        {
            Error::user_rejected()
        }
        _ => Error::transaction_failed(),
    };
    base.context(err).context(op)
}

/// Contract gateway talking to the chain over JSON-RPC, signing with the wallet's active account.
#[derive(Clone, Debug)]
pub struct RpcGateway<W> {
    wallet: W,
    transport: SwitchingTransport,
    token_address: Address,
    staking_address: Address,
    confirmation: Confirmation,
}

impl<W: WalletProvider> RpcGateway<W> {
    pub fn new(opt: &ChainOptions, wallet: W) -> Result<Self> {
        Ok(Self {
            wallet,
            transport: SwitchingTransport::new(opt.clone())?,
            token_address: opt.token_address,
            staking_address: opt.staking_address,
            confirmation: Confirmation {
                confirmations: opt.confirmations,
                timeout: opt.confirmation_timeout,
            },
        })
    }

    /// A provider which signs with whichever account is active in the wallet right now.
    fn provider(&self) -> Result<DynProvider> {
        let signer = self.wallet.signer()?;
        let client = RpcClient::new(self.transport.clone(), false);
        Ok(ProviderBuilder::new()
            .wallet(signer)
            .connect_client(client)
            .erased())
    }
}

impl<W: WalletProvider> ContractGateway for RpcGateway<W> {
    type Token = RpcToken;
    type Staking = RpcStaking;

    fn staking_address(&self) -> Address {
        self.staking_address
    }

    fn token_contract(&self) -> Result<RpcToken> {
        Ok(RpcToken {
            contract: ICiccaToken::new(self.token_address, self.provider()?),
            confirmation: self.confirmation,
        })
    }

    fn staking_contract(&self) -> Result<RpcStaking> {
        Ok(RpcStaking {
            contract: ICiccaStaking::new(self.staking_address, self.provider()?),
            confirmation: self.confirmation,
        })
    }
}

/// Token contract handle produced by [`RpcGateway`].
#[derive(Clone, Debug)]
pub struct RpcToken {
    contract: ICiccaToken::ICiccaTokenInstance<DynProvider>,
    confirmation: Confirmation,
}

impl TokenContract for RpcToken {
    async fn balance_of(&self, owner: Address) -> Result<TokenAmount> {
        self.contract
            .balanceOf(owner)
            .call()
            .await
            .context(|| Error::read_failed().context(format!("balanceOf({owner})")))
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<TokenAmount> {
        self.contract
            .allowance(owner, spender)
            .call()
            .await
            .context(|| Error::read_failed().context(format!("allowance({owner}, {spender})")))
    }

    async fn approve(&self, spender: Address, amount: TokenAmount) -> Result<SubmittedTx> {
        let pending = self
            .contract
            .approve(spender, amount)
            .send()
            .await
            .map_err(|err| write_error("approve", err))?;
        Ok(self.confirmation.watch("approve", pending))
    }
}

/// Staking contract handle produced by [`RpcGateway`].
#[derive(Clone, Debug)]
pub struct RpcStaking {
    contract: ICiccaStaking::ICiccaStakingInstance<DynProvider>,
    confirmation: Confirmation,
}

impl StakingContract for RpcStaking {
    async fn get_details(&self, user: Address) -> Result<StakeRecord> {
        let info = self
            .contract
            .getDetails(user)
            .call()
            .await
            .context(|| Error::read_failed().context(format!("getDetails({user})")))?;
        Ok(info.into())
    }

    async fn calculate_reward(&self, user: Address) -> Result<TokenAmount> {
        self.contract
            .calculateReward(user)
            .call()
            .await
            .context(|| Error::read_failed().context(format!("calculateReward({user})")))
    }

    async fn stake(&self, amount: TokenAmount) -> Result<SubmittedTx> {
        let pending = self
            .contract
            .stake(amount)
            .send()
            .await
            .map_err(|err| write_error("stake", err))?;
        Ok(self.confirmation.watch("stake", pending))
    }

    async fn unstake(&self) -> Result<SubmittedTx> {
        let pending = self
            .contract
            .unstake()
            .send()
            .await
            .map_err(|err| write_error("unstake", err))?;
        Ok(self.confirmation.watch("unstake", pending))
    }

    async fn withdraw_reward(&self) -> Result<SubmittedTx> {
        let pending = self
            .contract
            .withdrawReward()
            .send()
            .await
            .map_err(|err| write_error("withdrawReward", err))?;
        Ok(self.confirmation.watch("withdrawReward", pending))
    }
}
