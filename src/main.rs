use std::{process::exit, sync::Arc};

use cicca_staking::{
    Result,
    chain::{RpcGateway, options::ChainOptions},
    scheduler::RefreshScheduler,
    session::{SessionOptions, StakingSession},
    types::session::SessionSnapshot,
    units::ether_to_wei,
    wallet::{NullWallet, WalletOptions, WalletProvider},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Stake CICCA tokens and manage staking rewards.
#[derive(Debug, Parser)]
struct Options {
    /// Contract gateway options.
    #[clap(flatten)]
    chain: ChainOptions,

    /// Signing keys.
    #[clap(flatten)]
    wallet: WalletOptions,

    /// Session options.
    #[clap(flatten)]
    session: SessionOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect, load the account's staking state and print it.
    Status {
        /// Also print session metrics in the Prometheus text format.
        #[clap(long)]
        metrics: bool,
    },
    /// Connect the wallet and print the active account.
    Connect,
    /// Approve the staking contract to spend tokens.
    Approve {
        /// Amount in whole tokens, e.g. 150.5.
        amount: String,
    },
    /// Stake tokens.
    Stake {
        /// Amount in whole tokens, e.g. 150.5.
        amount: String,
    },
    /// Withdraw the entire stake.
    Unstake,
    /// Withdraw the accrued reward.
    Withdraw,
    /// Keep the staking state up to date and log every change until interrupted.
    Watch,
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    match snapshot.current_account_hex() {
        Some(account) => println!("account:            {account}"),
        None => println!("account:            (not connected)"),
    }
    let allowance = &snapshot.user_allowance;
    if allowance.needs_approval() {
        println!("allowance:          0 (approval needed)");
    } else {
        println!("allowance:          {}", allowance.approved_ether_amount);
    }
    let details = snapshot.stake_details.display();
    if details.is_loading {
        println!("stake:              loading");
    } else {
        println!("balance:            {}", details.token_balance);
        println!("staked:             {}", details.staked_amount);
        println!("stake start:        {}", details.start_time);
        println!("stake end:          {}", details.end_time);
        println!("reward available:   {}", details.reward_available_now);
        println!("reward claimed:     {}", details.reward_claimed_to_date);
        println!("claimed:            {}", details.claimed);
        let stake = &snapshot.stake_details;
        println!("can unstake:        {}", stake.can_unstake());
        println!("can withdraw:       {}", stake.can_withdraw_reward());
    }
    if let Some(err) = &snapshot.read_error {
        println!("last read error:    {err}");
    }
}

impl Options {
    async fn run<W>(self, wallet: W) -> Result<()>
    where
        W: WalletProvider + Clone + 'static,
    {
        let gateway = RpcGateway::new(&self.chain, wallet.clone())?;
        let session = Arc::new(StakingSession::new(gateway, wallet, self.session)?);
        if session.check_wallet_connected().await.is_none() {
            session.connect_wallet().await?;
        }

        match self.command {
            Command::Status { metrics } => {
                session.refresh().await?;
                print_snapshot(&session.snapshot());
                if metrics {
                    print!("{}", session.metrics().export()?);
                }
            }
            Command::Connect => {
                if let Some(account) = session.snapshot().current_account_hex() {
                    println!("{account}");
                }
            }
            Command::Approve { amount } => {
                let hash = session.approve_stake_amount(&amount).await?;
                println!("approved in {hash}");
                print_snapshot(&session.snapshot());
            }
            Command::Stake { amount } => {
                if let Some(account) = session.account().current_account() {
                    if session.fetch_allowance(account).await.is_ok() {
                        let allowance = session.snapshot().user_allowance;
                        if let Ok(wei) = ether_to_wei(Some(&amount)) {
                            if !allowance.covers(wei) {
                                tracing::warn!(
                                    allowance = %allowance.approved_ether_amount,
                                    %amount,
                                    "allowance does not cover this stake, run `approve` first"
                                );
                            }
                        }
                    }
                }
                let hash = session.stake_cicca_amount(&amount).await?;
                println!("staked in {hash}");
                print_snapshot(&session.snapshot());
            }
            Command::Unstake => {
                let hash = session.unstake_amount().await?;
                println!("unstaked in {hash}");
                print_snapshot(&session.snapshot());
            }
            Command::Withdraw => {
                let hash = session.withdraw_reward().await?;
                println!("reward withdrawn in {hash}");
                print_snapshot(&session.snapshot());
            }
            Command::Watch => {
                session.observe_accounts()?;
                let scheduler = RefreshScheduler::start(session.clone());
                let mut snapshots = session.subscribe();
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        res = snapshots.changed() => {
                            if res.is_err() {
                                break;
                            }
                            let snapshot = snapshots.borrow_and_update().clone();
                            tracing::info!(
                                account = ?snapshot.current_account_hex(),
                                phase = ?snapshot.phase,
                                allowance = %snapshot.user_allowance.approved_ether_amount,
                                details = ?snapshot.stake_details.display(),
                                read_error = ?snapshot.read_error,
                                "session updated"
                            );
                        }
                    }
                }
                scheduler.stop();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Options::parse();
    let res = match opt.wallet.local_wallet() {
        Ok(Some(wallet)) => opt.run(wallet).await,
        Ok(None) => opt.run(NullWallet).await,
        Err(err) => Err(err),
    };
    if let Err(err) = res {
        eprintln!("cicca-staking failed: {err}");
        exit(1);
    }
}
