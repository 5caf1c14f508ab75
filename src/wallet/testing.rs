#![cfg(any(test, feature = "testing"))]

use std::sync::Arc;

use alloy::network::EthereumWallet;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::WalletProvider;
use crate::{Error, Result, error::ensure, types::common::Address};

/// A scripted wallet for tests.
///
/// It cannot sign; pair it with [`MockGateway`](crate::chain::testing::MockGateway), which binds
/// contract handles to [`active_account`](Self::active_account) instead.
#[derive(Clone, Debug)]
pub struct MockWallet {
    state: Arc<Mutex<MockWalletState>>,
    changes: Arc<watch::Sender<Vec<Address>>>,
}

#[derive(Debug, Default)]
struct MockWalletState {
    accounts: Vec<Address>,
    authorized: bool,
    reject_requests: bool,
    requests: usize,
    subscriptions: usize,
}

impl MockWallet {
    /// A wallet holding `accounts`, not yet authorized.
    pub fn new(accounts: impl IntoIterator<Item = Address>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockWalletState {
                accounts: accounts.into_iter().collect(),
                ..Default::default()
            })),
            changes: Arc::new(watch::Sender::new(Vec::new())),
        }
    }

    /// Authorize the session without going through a request, as if a previous visit had.
    pub fn authorize(&self) {
        self.state.lock().authorized = true;
    }

    /// Make subsequent access requests fail as if the user declined them.
    pub fn reject_requests(&self, reject: bool) {
        self.state.lock().reject_requests = reject;
    }

    /// Replace the account set and notify subscribers, as the wallet does when the user switches
    /// accounts.
    pub fn switch_accounts(&self, accounts: impl IntoIterator<Item = Address>) {
        let accounts: Vec<_> = accounts.into_iter().collect();
        self.state.lock().accounts = accounts.clone();
        self.changes.send_replace(accounts);
    }

    /// The account a signer would currently sign for.
    pub fn active_account(&self) -> Option<Address> {
        let state = self.state.lock();
        if state.authorized {
            state.accounts.first().copied()
        } else {
            None
        }
    }

    /// How many times access has been requested.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    /// How many account change subscriptions have been made.
    pub fn subscriptions(&self) -> usize {
        self.state.lock().subscriptions
    }
}

impl WalletProvider for MockWallet {
    async fn accounts(&self) -> Result<Vec<Address>> {
        let state = self.state.lock();
        if state.authorized {
            Ok(state.accounts.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn request_accounts(&self) -> Result<Vec<Address>> {
        let mut state = self.state.lock();
        state.requests += 1;
        ensure!(
            !state.reject_requests,
            Error::user_rejected().context("mock wallet declined access")
        );
        state.authorized = true;
        Ok(state.accounts.clone())
    }

    fn account_changes(&self) -> Result<watch::Receiver<Vec<Address>>> {
        self.state.lock().subscriptions += 1;
        Ok(self.changes.subscribe())
    }

    fn signer(&self) -> Result<EthereumWallet> {
        Err(Error::unsupported().context("mock wallet cannot sign"))
    }
}
