#![allow(unused)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, panic};

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use log::info;

use dbsync_rs::db::SyncMode;
use dbsync_rs::net::client::SyncClient;
use dbsync_rs::net::server::SyncServer;
use dbsynccli::config::ConfigLoad;
use dbsynccli::demo::{add_demo_rows, demo_counts, open_demo_db};
use dbsynccli::trace;

#[derive(Debug, Parser)]
#[command(version)]
#[command(author, about)]
pub struct Args {
    #[clap(short, long, help = "debug mode")]
    debug: bool,

    /// Configuration file path, default 'config/dbsync.toml'
    #[clap(short = 'c', long = "config", default_value = "config/dbsync.toml")]
    config: String,

    #[clap(long, help = "Bind/connect host; overrides the config file")]
    host: Option<String>,

    #[clap(short, long, help = "Bind/connect port; overrides the config file")]
    port: Option<u16>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync server over the demo schema.
    Server,
    /// Register against a running server, add demo rows and synchronize.
    Demo {
        #[clap(long, default_value = "3", help = "How many demo rows to insert")]
        rows: usize,
        #[clap(long, default_value = "1", help = "How many synchronize rounds to run")]
        rounds: usize,
    },
    /// Print a running server's status document.
    Status,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.dbsynccli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;
    info!("dbsynccli start args: {:?}", &args);

    let cfg = match ConfigLoad::new(args.config.as_ref()) {
        Ok(c) => c,
        Err(_) => ConfigLoad::default(),
    };
    if args.debug {
        println!("{:?}", &cfg);
    }
    info!("dbsynccli start config: {:?}", &cfg);

    let host = args.host.clone().unwrap_or_else(|| cfg.get_host());
    let port = args.port.unwrap_or_else(|| cfg.get_port());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
        std::process::exit(0);
    })
    .expect("Error setting Ctrl-C handler");

    match args.cmd {
        Command::Server => {
            let db = open_demo_db(SyncMode::Server)?;
            let server = SyncServer::new(db, &host, port);
            println!("sync server listening on {}:{}", host, port);
            server.serve().await?;
        }
        Command::Demo { rows, rounds } => {
            let db = open_demo_db(SyncMode::Client)?;
            let client = SyncClient::new(db, &host, port);
            let node = client.register(None).await?;
            println!("registered node {}", node.node_id);
            for round in 0..rounds {
                let city = add_demo_rows(client.db(), rows)?;
                let version = client.synchronize().await?;
                println!("round {}: pushed {} into {}, server version is now {:?}", round, rows, city, version);
            }
            let pulled = client.pull(serde_json::Value::Null).await?;
            let (cities, houses) = demo_counts(client.db())?;
            println!("pulled {} operations; local state: {} cities, {} houses", pulled, cities, houses);
        }
        Command::Status => {
            let db = open_demo_db(SyncMode::Client)?;
            let client = SyncClient::new(db, &host, port);
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
