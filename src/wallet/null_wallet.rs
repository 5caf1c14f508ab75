//! The wallet provider used when there is no wallet at all.

use alloy::network::EthereumWallet;
use tokio::sync::watch;

use super::WalletProvider;
use crate::{Error, Result, types::common::Address};

/// A wallet provider that is not there.
///
/// Every call fails with a "provider unavailable" error, which the presentation layer turns into
/// an "install a wallet" prompt. The session itself stays usable and simply remains disconnected.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullWallet;

fn unavailable() -> Error {
    Error::provider_unavailable().context("no wallet configured")
}

impl WalletProvider for NullWallet {
    async fn accounts(&self) -> Result<Vec<Address>> {
        Err(unavailable())
    }

    async fn request_accounts(&self) -> Result<Vec<Address>> {
        Err(unavailable())
    }

    fn account_changes(&self) -> Result<watch::Receiver<Vec<Address>>> {
        Err(unavailable())
    }

    fn signer(&self) -> Result<EthereumWallet> {
        Err(unavailable())
    }
}
