use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Parser;
use simchain::config::{BlockFactory, BlockchainConfig};
use simchain::crypto::{generate_keypair, Address, KeyPair};
use simchain::miner::Miner;
use simchain::network::{Network, SimNetwork};
use simchain::participant::{Participant, ParticipantHandle};
use tokio::sync::{mpsc, Mutex};

/// Run a small in-process simchain network: some accounts mine, the
/// rest just hold a balance, and a handful of mining rounds are
/// simulated before the resulting balances are printed.
#[derive(Parser, Debug)]
#[command(name = "simchain", about = "A pedagogical account-based proof-of-work chain")]
struct Cli {
    /// Number of accounts that mine blocks.
    #[arg(long, default_value_t = 2)]
    miners: usize,

    /// Number of accounts that only hold a balance and post transactions.
    #[arg(long, default_value_t = 2)]
    clients: usize,

    /// Starting balance credited to every account in the genesis block.
    #[arg(long, default_value_t = 1000)]
    initial_balance: u64,

    /// PoW difficulty: number of leading zero bits the block hash must satisfy.
    #[arg(long, default_value_t = 12)]
    pow_leading_zeroes: u32,

    /// Coinbase reward paid to whoever mines a block.
    #[arg(long, default_value_t = 25)]
    coinbase_reward: u64,

    /// Mining rounds each miner runs before the demo settles.
    #[arg(long, default_value_t = 5)]
    rounds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let miner_keys: Vec<KeyPair> = (0..cli.miners).map(|_| generate_keypair()).collect();
    let client_keys: Vec<KeyPair> = (0..cli.clients).map(|_| generate_keypair()).collect();

    let mut initial_balances: BTreeMap<Address, u64> = BTreeMap::new();
    for kp in miner_keys.iter().chain(client_keys.iter()) {
        initial_balances.insert(kp.address(), cli.initial_balance);
    }

    let config = Arc::new(BlockchainConfig::new(
        cli.pow_leading_zeroes,
        cli.coinbase_reward,
        1,
        6,
        initial_balances,
    )?);
    let genesis = config.make_genesis();
    let network: Arc<dyn Network> = Arc::new(SimNetwork::new());

    log::info!(
        "starting simchain demo: {} miner(s), {} client(s), pow_leading_zeroes={}",
        cli.miners,
        cli.clients,
        cli.pow_leading_zeroes
    );

    let mut miner_handles = Vec::new();
    for kp in miner_keys {
        let address = kp.address();
        let miner = Arc::new(Mutex::new(Miner::new(
            kp,
            genesis.clone(),
            Arc::clone(&network),
            Arc::clone(&config),
        )));
        let (tx, rx) = mpsc::channel(256);
        network.register(address.clone(), tx).await;
        miner_handles.push((address, miner, rx));
    }

    let mut client_handles = Vec::new();
    for kp in client_keys {
        let address = kp.address();
        let participant = Arc::new(Mutex::new(Participant::new(
            kp,
            genesis.clone(),
            Arc::clone(&network),
            Arc::clone(&config),
        )));
        let (tx, rx) = mpsc::channel(256);
        network.register(address.clone(), tx).await;
        client_handles.push((address, participant, rx));
    }

    let mut background = Vec::new();
    let mut miner_refs = Vec::new();
    for (address, miner, mut rx) in miner_handles {
        let mailbox_miner = Arc::clone(&miner);
        background.push(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                mailbox_miner.lock().await.handle_envelope(envelope).await;
            }
        }));

        let mining_miner = Arc::clone(&miner);
        let rounds = cli.rounds;
        background.push(tokio::spawn(async move {
            for _ in 0..rounds {
                if let Err(err) = mining_miner.lock().await.mine_and_broadcast().await {
                    log::warn!("mining round failed: {}", err);
                }
                tokio::task::yield_now().await;
            }
        }));
        miner_refs.push((address, miner));
    }

    let mut client_refs = Vec::new();
    for (address, participant, mut rx) in client_handles {
        let mailbox_participant = Arc::clone(&participant);
        background.push(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                mailbox_participant
                    .lock()
                    .await
                    .handle_envelope(envelope)
                    .await;
            }
        }));
        client_refs.push((address, participant));
    }

    // Give the mining tasks time to finish their rounds and let gossip
    // settle before reading final balances.
    tokio::time::sleep(std::time::Duration::from_millis(200 * cli.rounds.max(1))).await;

    println!("Final balances:");
    for (address, miner) in &miner_refs {
        let balance = miner.lock().await.participant().confirmed_balance();
        println!("  {} (miner)  {}", address, balance);
    }
    for (address, participant) in &client_refs {
        let balance = participant.lock().await.confirmed_balance();
        println!("  {} (client)  {}", address, balance);
    }

    for handle in background {
        handle.abort();
    }

    Ok(())
}
