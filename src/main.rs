//! keyquorum - MPC Node Entrypoint
//!
//! One binary covers both roles; `MPC_NODE_TYPE` selects coordinator or
//! participant behavior.
//!
//! Run modes:
//!   keyquorum run      - start the node with env configuration
//!   keyquorum check    - load and print configuration, then exit

use std::env;

use keyquorum::{init_logging, LogLevel, MpcConfig, Node};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "run" => run_node().await,
        "check" => check_config(),
        "help" | "--help" | "-h" => print_usage(),
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("keyquorum - Distributed Threshold-Signature Wallet Node");
    println!();
    println!("Usage:");
    println!("  keyquorum run      Start the MPC node");
    println!("  keyquorum check    Validate configuration and exit");
    println!();
    println!("Environment Variables:");
    println!("  MPC_NODE_ID                   Node identity (required)");
    println!("  MPC_NODE_TYPE                 coordinator | participant");
    println!("  MPC_RPC_PORT                  Node-to-node listen port (default: 9000)");
    println!("  MPC_ADVERTISE_ADDRESS         Address peers reach this node at");
    println!("  MPC_TLS_ENABLED               1 to require TLS 1.3 mutual auth");
    println!("  MPC_TLS_CERT_FILE             Server certificate (PEM)");
    println!("  MPC_TLS_KEY_FILE              Server private key (PEM)");
    println!("  MPC_TLS_CA_CERT_FILE          CA bundle for peer verification");
    println!("  MPC_SUPPORTED_PROTOCOLS       Subset of gg18,gg20,frost");
    println!("  MPC_SESSION_TIMEOUT           Session lifetime in seconds");
    println!("  MPC_DB_PATH                   SQLite database path");
    println!("  MPC_KEY_SHARE_STORAGE_PATH    Directory for encrypted shares");
    println!("  MPC_KEY_SHARE_ENCRYPTION_KEY  Symmetric key for shares at rest (required)");
    println!("  MPC_CONSUL_ADDRESS            Service registry endpoint");
    println!("  MPC_LOG_LEVEL                 trace|debug|info|warn|error");
    println!("  MPC_LOG_JSON                  1 for JSON log output");
}

fn load_config() -> Option<MpcConfig> {
    match MpcConfig::from_env() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            None
        }
    }
}

fn check_config() {
    if let Some(cfg) = load_config() {
        cfg.print_summary();
        match cfg.validate_for_production() {
            Ok(()) => println!("Production validation: OK"),
            Err(e) => println!("Production validation: {}", e),
        }
    }
}

async fn run_node() {
    let Some(cfg) = load_config() else {
        std::process::exit(1);
    };

    if let Err(e) = init_logging(LogLevel::from(cfg.log_level.as_str()), cfg.log_json) {
        eprintln!("Logging error: {}", e);
        std::process::exit(1);
    }

    cfg.print_summary();

    let node = match Node::build(cfg) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Node startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = node.run().await {
        eprintln!("Node error: {}", e);
        std::process::exit(1);
    }
}
