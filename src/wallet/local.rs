//! A wallet backed by locally held private keys.

use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::{
    network::EthereumWallet,
    signers::local::{MnemonicBuilder, PrivateKeySigner},
};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::WalletProvider;
use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::Address,
};

/// A key-backed [`WalletProvider`].
///
/// Like a browser wallet, it starts out unauthorized: [`accounts`](WalletProvider::accounts)
/// reports nothing until access has been requested. Holding the keys is taken as the user's
/// consent, so [`request_accounts`](WalletProvider::request_accounts) always succeeds.
#[derive(Clone, Debug)]
pub struct LocalWallet {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    #[debug(skip)]
    signers: Vec<PrivateKeySigner>,
    selected: Mutex<usize>,
    authorized: AtomicBool,
    changes: watch::Sender<Vec<Address>>,
}

impl LocalWallet {
    /// A wallet over the given signers. The first one is active.
    pub fn new(signers: Vec<PrivateKeySigner>) -> Result<Self> {
        ensure!(
            !signers.is_empty(),
            Error::bad_request().context("wallet needs at least one key")
        );
        Ok(Self {
            inner: Arc::new(Inner {
                signers,
                selected: Mutex::new(0),
                authorized: AtomicBool::new(false),
                changes: watch::Sender::new(Vec::new()),
            }),
        })
    }

    /// Derive `accounts` consecutive accounts from a BIP-39 mnemonic.
    pub fn from_mnemonic(phrase: &str, accounts: u32) -> Result<Self> {
        let signers = (0..accounts.max(1))
            .map(|index| {
                MnemonicBuilder::english()
                    .phrase(phrase)
                    .index(index)
                    .and_then(|builder| builder.build())
                    .context(|| Error::bad_request().context(format!("deriving account {index}")))
            })
            .collect::<Result<_>>()?;
        Self::new(signers)
    }

    /// A single-account wallet from a hex-encoded private key.
    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer = PrivateKeySigner::from_str(key)
            .context(|| Error::bad_request().context("invalid private key"))?;
        Self::new(vec![signer])
    }

    /// Make the account at `index` the active one, notifying subscribers.
    pub fn select_account(&self, index: usize) -> Result<Address> {
        ensure!(
            index < self.inner.signers.len(),
            Error::bad_request().context(format!(
                "account index {index} out of range (wallet has {})",
                self.inner.signers.len()
            ))
        );
        *self.inner.selected.lock() = index;
        self.notify();
        Ok(self.inner.signers[index].address())
    }

    /// Withdraw authorization, as if the user disconnected the site in their wallet.
    pub fn revoke(&self) {
        self.inner.authorized.store(false, Ordering::SeqCst);
        self.notify();
    }

    fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::SeqCst)
    }

    /// All addresses, the active one first.
    fn addresses(&self) -> Vec<Address> {
        let selected = *self.inner.selected.lock();
        let mut addresses = vec![self.inner.signers[selected].address()];
        addresses.extend(
            self.inner
                .signers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != selected)
                .map(|(_, signer)| signer.address()),
        );
        addresses
    }

    fn authorized_addresses(&self) -> Vec<Address> {
        if self.is_authorized() {
            self.addresses()
        } else {
            Vec::new()
        }
    }

    fn notify(&self) {
        self.inner.changes.send_replace(self.authorized_addresses());
    }
}

impl WalletProvider for LocalWallet {
    async fn accounts(&self) -> Result<Vec<Address>> {
        Ok(self.authorized_addresses())
    }

    async fn request_accounts(&self) -> Result<Vec<Address>> {
        if !self.inner.authorized.swap(true, Ordering::SeqCst) {
            self.notify();
        }
        Ok(self.addresses())
    }

    fn account_changes(&self) -> Result<watch::Receiver<Vec<Address>>> {
        Ok(self.inner.changes.subscribe())
    }

    fn signer(&self) -> Result<EthereumWallet> {
        ensure!(
            self.is_authorized(),
            Error::provider_unavailable().context("wallet has not authorized this session")
        );
        let selected = *self.inner.selected.lock();
        Ok(EthereumWallet::from(self.inner.signers[selected].clone()))
    }
}
