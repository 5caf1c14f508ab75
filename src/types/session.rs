//! Types that make up the observable staking session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::common::{Address, AllowanceState, StakeDetails, lower_hex};
use crate::Error;

/// The published session state, shared by everything that mutates it.
pub(crate) type SharedState = Arc<watch::Sender<SessionSnapshot>>;

/// Where the session is in the lifecycle of a write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    /// No write in flight; background refreshes may run.
    #[default]
    Idle,
    /// A transaction is being built, signed and sent.
    Submitting,
    /// A transaction was sent and we are waiting for it to be included.
    Confirming,
    /// The transaction is included; dependent state is being re-read.
    Refreshing,
    /// The write failed. Transient: the session returns to [`Idle`](Self::Idle) immediately.
    Failed,
}

impl TransactionPhase {
    /// Whether background refreshes may publish state in this phase.
    pub fn allows_refresh(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// A consistent view of the whole session, published on every change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSnapshot {
    /// True while a write is in flight; write-triggering controls should be disabled.
    pub is_loading: bool,

    /// The current phase of the write path.
    pub phase: TransactionPhase,

    /// The connected wallet address, if any.
    pub current_account: Option<Address>,

    /// The staking contract's allowance over the account's tokens.
    pub user_allowance: AllowanceState,

    /// The account's stake, as last read.
    pub stake_details: StakeDetails,

    /// The error from the most recent failed command, cleared by the next successful one.
    pub last_error: Option<Error>,

    /// The error from the most recent failed read, cleared by the next successful read.
    ///
    /// This is distinct from [`StakeDetails::is_loading`]: a session whose reads keep failing stays
    /// "loading" but also reports why.
    pub read_error: Option<Error>,

    /// Bumped every time a write begins, so that background reads which started before the write
    /// can recognize that their results are stale.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl SessionSnapshot {
    /// Whether background refreshes are currently allowed.
    pub fn allow_refresh(&self) -> bool {
        self.phase.allows_refresh()
    }

    /// The connected account as a lower-cased hex string.
    pub fn current_account_hex(&self) -> Option<String> {
        self.current_account.as_ref().map(lower_hex)
    }

    /// Switch to a different account (or none), discarding data read for the previous one.
    ///
    /// Returns `true` if the account actually changed.
    pub(crate) fn set_account(&mut self, account: Option<Address>) -> bool {
        if self.current_account == account {
            return false;
        }
        self.current_account = account;
        self.user_allowance = AllowanceState::default();
        self.stake_details = StakeDetails::default();
        self.read_error = None;
        true
    }
}
