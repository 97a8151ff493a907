use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cpytro-chain", about = "CpyTro proof-of-work ledger node")]
pub struct Opt {
    #[arg(long, global = true, help = "Path to a TOML config file")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        name = "createblockchain",
        about = "Create the ledger and commit the genesis block"
    )]
    Createblockchain,
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(name = "send", about = "Send coins between addresses")]
    Send {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send, in base units")]
        amount: u64,
        #[arg(long, help = "Fee in base units; defaults to the relay minimum")]
        fee: Option<u64>,
        #[arg(long, help = "Mine the transaction into a block locally instead of relaying it")]
        mine: bool,
        #[arg(long, help = "Node to submit to; defaults to the configured listen address")]
        node: Option<String>,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a ledger node")]
    StartNode {
        #[arg(long, help = "Mine and send rewards to ADDRESS")]
        miner: Option<String>,
    },
    #[command(name = "status", about = "Query a running node's status as JSON")]
    Status {
        #[arg(long, help = "Node to query; defaults to the configured listen address")]
        node: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_with_options() {
        let opt = Opt::parse_from([
            "cpytro-chain",
            "send",
            "from-addr",
            "to-addr",
            "500",
            "--fee",
            "20000",
            "--mine",
        ]);
        match opt.command {
            Command::Send {
                amount, fee, mine, ..
            } => {
                assert_eq!(amount, 500);
                assert_eq!(fee, Some(20_000));
                assert!(mine);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let opt = Opt::parse_from(["cpytro-chain", "status", "--config", "node.toml"]);
        assert_eq!(opt.config, Some(PathBuf::from("node.toml")));
        assert!(matches!(opt.command, Command::Status { node: None }));
    }
}
