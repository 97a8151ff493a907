// Entry point for the node binary: parse the command line, load the config, run one command.
use clap::Parser;
use cpytro_chain::{
    address_to_locking_key, convert_address, format_coins, public_key_to_locking_key,
    request_status, send_tx, validate_address, Blockchain, Command, Config, MemoryPool, Miner,
    Opt, Server, Transaction, Wallets, MIN_TRANSACTION_FEE,
};
use data_encoding::HEXLOWER;
use log::{error, info, warn, LevelFilter};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    // Info by default; RUST_LOG still wins when set
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(opt.config.as_deref())?;

    match opt.command {
        Command::Createblockchain => {
            let blockchain =
                Blockchain::create_blockchain_with_path(&config.ledger_path()?, &config.chain)?;
            println!(
                "Done! Genesis block: {}",
                HEXLOWER.encode(&blockchain.tip_hash())
            );
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(&config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let locking_key = address_to_locking_key(&address)?;
            let blockchain = Blockchain::open(&config.ledger_path()?, &config.chain)?;
            let balance = blockchain.balance(&locking_key)?;
            println!("Balance of {address}: {balance} ({})", format_coins(balance));
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(&config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            fee,
            mine,
            node,
        } => {
            if !validate_address(&from) {
                return Err(format!("Invalid sender address: {from}").into());
            }
            let to_key = address_to_locking_key(&to)?;
            let wallets = Wallets::load(&config.wallet_path())?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| format!("No local wallet for {from}"))?;

            let blockchain = Blockchain::open(&config.ledger_path()?, &config.chain)?;
            let fee = fee.unwrap_or(MIN_TRANSACTION_FEE);
            let transaction =
                Transaction::new_utxo_transaction(wallet, &to_key, amount, fee, &blockchain)?;

            if mine {
                // Pay the reward back to the sender
                let block = blockchain.mine_block(wallet.locking_key(), vec![transaction])?;
                println!("Mined block {} at height {}", block.hash_hex(), block.get_height());
            } else {
                drop(blockchain);
                let addr = node_address(node, &config)?;
                send_tx(addr, &transaction, CLIENT_TIMEOUT)?;
                println!("Submitted transaction {} to {addr}", transaction.id_hex());
            }
        }
        Command::Printchain => {
            let blockchain = Blockchain::open(&config.ledger_path()?, &config.chain)?;
            for block in blockchain.iterator() {
                println!("Height: {}", block.get_height());
                println!("Prev. hash: {}", HEXLOWER.encode(block.get_previous_hash()));
                println!("Hash: {}", block.hash_hex());
                println!("Merkle root: {}", HEXLOWER.encode(block.get_merkle_root()));
                println!("Timestamp: {}", block.get_timestamp());
                println!("Target: {}", HEXLOWER.encode(block.get_target()));
                println!("Nonce: {}", block.get_nonce());

                for tx in block.get_transactions() {
                    println!("- Transaction {} ({:?})", tx.id_hex(), tx.get_kind());
                    for input in tx.get_vin() {
                        let from = convert_address(&public_key_to_locking_key(input.get_public_key()));
                        println!(
                            "-- Input {}:{} from {from}",
                            HEXLOWER.encode(input.get_prior_txid()),
                            input.get_output_index(),
                        )
                    }
                    for output in tx.get_vout() {
                        println!(
                            "-- Output value = {}, to = {}",
                            output.get_value(),
                            convert_address(output.get_locking_key()),
                        )
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::open(&config.ledger_path()?, &config.chain)?;
            let count = blockchain.reindex_utxo()?;
            println!("Done! There are {count} unspent outputs in the UTXO set.");
        }
        Command::StartNode { miner } => start_node(config, miner)?,
        Command::Status { node } => {
            let addr = node_address(node, &config)?;
            let status = request_status(addr, CLIENT_TIMEOUT)?;
            let report = serde_json::json!({
                "height": status.height,
                "tip_hash": HEXLOWER.encode(&status.tip_hash),
                "issued_supply": status.issued_supply,
                "mempool_size": status.mempool_size,
                "active_peers": status.active_peers,
                "mining": {
                    "state": status.mining.state,
                    "blocks_mined": status.mining.blocks_mined,
                    "earned": status.mining.earned,
                    "hashes_tried": status.mining.hashes_tried,
                    "hash_rate": status.mining.hash_rate,
                    "last_rejection": status.mining.last_rejection,
                    "last_block_hash": status.mining.last_block_hash.map(|h| HEXLOWER.encode(&h)),
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn node_address(node: Option<String>, config: &Config) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let addr = node.unwrap_or_else(|| config.node.listen_addr.clone());
    addr.parse()
        .map_err(|e| format!("Invalid node address {addr}: {e}").into())
}

// Runs the P2P server and, if enabled, the miner. Only a fatal miner error returns.
fn start_node(config: Config, miner: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let blockchain =
        Blockchain::create_blockchain_with_path(&config.ledger_path()?, &config.chain)?;
    info!(
        "Ledger at height {} with tip {}",
        blockchain.height(),
        HEXLOWER.encode(&blockchain.tip_hash())
    );

    let mempool = Arc::new(MemoryPool::with_capacity(
        config.node.max_mempool_transactions,
    ));
    let server = Server::new(blockchain.clone(), Arc::clone(&mempool), &config.node)?;

    let miner_address = miner.or_else(|| config.mining.miner_address.clone());
    let miner_address = match miner_address {
        Some(address) if config.node.mining_enabled => address,
        Some(_) => {
            info!("Mining disabled by configuration");
            return Ok(server.run()?);
        }
        None => {
            if config.node.mining_enabled {
                warn!("Mining enabled but no miner address configured; running as relay");
            }
            return Ok(server.run()?);
        }
    };

    let miner_key = address_to_locking_key(&miner_address)?;
    info!("Mining is on. Address to receive rewards: {miner_address}");
    let miner = Miner::new(
        blockchain,
        mempool,
        Arc::new(server.clone()),
        miner_key,
        &config.mining,
    );
    let server = server.with_miner(miner.handle());

    thread::spawn(move || {
        if let Err(e) = server.run() {
            error!("Server error: {e}");
            process::exit(1);
        }
    });

    miner.run()?;
    Ok(())
}
