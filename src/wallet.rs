//! The wallet provider and the account session built on top of it.
//!
//! A [`WalletProvider`] stands in for the browser wallet extension: it knows which accounts the
//! user has authorized, can prompt for access, reports account switches, and signs transactions
//! for the active account. The [`AccountSession`] tracks which account the staking session is
//! acting for.

use std::{future::Future, sync::Arc};

use alloy::network::EthereumWallet;
use clap::Parser;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    Error, Result,
    metrics::SessionMetrics,
    types::{
        common::Address,
        session::{SessionSnapshot, SharedState},
    },
};

pub mod local;
mod null_wallet;
pub mod testing;

pub use local::LocalWallet;
pub use null_wallet::NullWallet;

/// A source of accounts and signatures.
pub trait WalletProvider: Send + Sync {
    /// The accounts the user has already authorized, without prompting. The active account is
    /// first.
    fn accounts(&self) -> impl Send + Future<Output = Result<Vec<Address>>>;

    /// Ask the user to grant access to their accounts. The active account is first.
    fn request_accounts(&self) -> impl Send + Future<Output = Result<Vec<Address>>>;

    /// Subscribe to changes in the authorized account set.
    ///
    /// The receiver yields the full new account list (active account first) every time it changes.
    fn account_changes(&self) -> Result<watch::Receiver<Vec<Address>>>;

    /// A signer for the currently active account.
    fn signer(&self) -> Result<EthereumWallet>;
}

/// Key material for a [`LocalWallet`].
#[derive(Clone, derive_more::Debug, Parser)]
pub struct WalletOptions {
    /// Mnemonic phrase to derive signing accounts from.
    #[clap(long, env = "CICCA_STAKING_MNEMONIC", conflicts_with = "private_key")]
    #[debug(skip)]
    pub mnemonic: Option<String>,

    /// Number of accounts to derive from the mnemonic.
    #[clap(long, env = "CICCA_STAKING_ACCOUNTS", default_value = "1")]
    pub accounts: u32,

    /// Hex-encoded private key of a single signing account.
    #[clap(long, env = "CICCA_STAKING_PRIVATE_KEY")]
    #[debug(skip)]
    pub private_key: Option<String>,
}

impl WalletOptions {
    /// Build the configured wallet, or [`None`] if no key material was given.
    pub fn local_wallet(&self) -> Result<Option<LocalWallet>> {
        if let Some(phrase) = &self.mnemonic {
            return LocalWallet::from_mnemonic(phrase, self.accounts).map(Some);
        }
        if let Some(key) = &self.private_key {
            return LocalWallet::from_private_key(key).map(Some);
        }
        Ok(None)
    }
}

/// Tracks the account the session is acting for.
#[derive(Debug)]
pub struct AccountSession<W> {
    wallet: W,
    state: SharedState,
    metrics: SessionMetrics,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl<W> Drop for AccountSession<W> {
    fn drop(&mut self) {
        if let Some(task) = self.observer.lock().take() {
            task.abort();
        }
    }
}

impl<W: WalletProvider> AccountSession<W> {
    pub(crate) fn new(wallet: W, state: SharedState, metrics: SessionMetrics) -> Self {
        Self {
            wallet,
            state,
            metrics,
            observer: Mutex::new(None),
        }
    }

    /// Apply `f` to the snapshot, publishing and updating metrics if it reports a change.
    pub(crate) fn publish(&self, f: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        let changed = self.state.send_if_modified(f);
        if changed {
            self.metrics.observe(&self.state.borrow());
        }
        changed
    }

    /// The underlying wallet provider.
    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    /// The account currently in use, if any.
    pub fn current_account(&self) -> Option<Address> {
        self.state.borrow().current_account
    }

    /// Pick up an already-authorized account without prompting the user.
    ///
    /// If the wallet has no authorized accounts the current account is left as it is. A missing
    /// wallet is not fatal: it is logged and recorded, and the session simply stays disconnected.
    pub async fn check_wallet_connected(&self) -> Option<Address> {
        match self.wallet.accounts().await {
            Ok(accounts) => {
                if let Some(account) = accounts.first() {
                    self.set_account(Some(*account));
                }
            }
            Err(err) => {
                err.log("check wallet connected");
                self.publish(|s| {
                    s.last_error = Some(err);
                    true
                });
            }
        }
        self.current_account()
    }

    /// Ask the user for access to their accounts and switch to the first one granted.
    #[tracing::instrument(skip(self))]
    pub async fn connect_wallet(&self) -> Result<Address> {
        let res = match self.wallet.request_accounts().await {
            Ok(accounts) => accounts
                .first()
                .copied()
                .ok_or_else(|| Error::user_rejected().context("wallet granted no accounts")),
            Err(err) => Err(err),
        };
        match res {
            Ok(account) => {
                self.set_account(Some(account));
                self.publish(|s| s.last_error.take().is_some());
                tracing::info!(%account, "wallet connected");
                Ok(account)
            }
            Err(err) => {
                err.log("connect wallet");
                self.publish(|s| {
                    s.last_error = Some(err.clone());
                    true
                });
                Err(err)
            }
        }
    }

    /// Follow account switches reported by the wallet.
    ///
    /// The subscription is made at most once per session; later calls are no-ops.
    pub fn observe(self: &Arc<Self>) -> Result<()>
    where
        W: 'static,
    {
        let mut observer = self.observer.lock();
        if observer.is_some() {
            return Ok(());
        }
        let mut changes = self.wallet.account_changes()?;

        let session = Arc::downgrade(self);
        *observer = Some(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let accounts = changes.borrow_and_update().clone();
                let Some(session) = session.upgrade() else {
                    break;
                };
                tracing::debug!(?accounts, "wallet accounts changed");
                session.set_account(accounts.first().copied());
            }
            tracing::debug!("stopped observing wallet accounts");
        }));
        Ok(())
    }

    /// Switch to `account`, discarding data loaded for the previous one.
    pub(crate) fn set_account(&self, account: Option<Address>) -> bool {
        let changed = self.publish(|s| s.set_account(account));
        if changed {
            match account {
                Some(account) => tracing::info!(%account, "active account changed"),
                None => tracing::info!("no active account"),
            }
        }
        changed
    }
}
