mod service;
mod system_metrics;
mod worker;

use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use chunk_store::ChunkStore;
use dfs_lib::{
    ChunkClient, Config, DfsError, DfsResult, MasterClient, RegisterChunkServerRequest,
    ReplicationTask,
};

use crate::service::{chunk_router, ServerState};
use crate::worker::{run_heartbeat_loop, run_maintenance_loop, run_replication_worker};

fn usage() -> String {
    "usage: chunk_server <server_id> <address> <port> [--config <path>] [--zone <zone>] [--data-dir <path>]"
        .to_string()
}

struct ServerOptions {
    server_id: String,
    address: String,
    port: u16,
    config_path: Option<PathBuf>,
    zone: Option<String>,
    data_dir: Option<PathBuf>,
}

fn parse_args() -> Result<ServerOptions, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let server_id = args[0].clone();
    let address = args[1].clone();
    let port: u16 = args[2]
        .parse()
        .map_err(|e| format!("invalid port {}: {}\n{}", args[2], e, usage()))?;

    let mut options = ServerOptions {
        server_id,
        address,
        port,
        config_path: None,
        zone: None,
        data_dir: None,
    };

    let mut i = 3usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--zone" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --zone".to_string())?;
                options.zone = Some(value.clone());
            }
            "--data-dir" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --data-dir".to_string())?;
                options.data_dir = Some(PathBuf::from(value));
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }

    Ok(options)
}

async fn run(options: ServerOptions) -> DfsResult<()> {
    let config = match &options.config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    let data_dir = options.data_dir.clone().unwrap_or_else(|| {
        PathBuf::from(&config.data_directory).join(format!("chunks_{}", options.port))
    });
    let store = Arc::new(ChunkStore::open(data_dir).await?);

    let master = MasterClient::new(&config.master_endpoint());
    let register = RegisterChunkServerRequest {
        server_id: options.server_id.clone(),
        address: options.address.clone(),
        port: options.port,
        zone: options.zone.clone().unwrap_or_else(|| config.zone.clone()),
        total_space: store.total_space(),
    };
    let response = master.register_server(&register).await?;
    if !response.success {
        return Err(DfsError::Unavailable(format!(
            "master rejected registration: {}",
            response.message
        )));
    }
    info!(
        "chunk server {} registered with master at {}",
        options.server_id,
        config.master_endpoint()
    );

    let (repl_tx, repl_rx) = mpsc::unbounded_channel::<ReplicationTask>();
    let state = Arc::new(ServerState {
        server_id: options.server_id.clone(),
        register,
        store: store.clone(),
        master: master.clone(),
        chunks: ChunkClient::new(),
        repl_tx,
    });

    let heartbeat = tokio::spawn(run_heartbeat_loop(
        state.clone(),
        config.heartbeat_interval_ms,
    ));
    let replicator = tokio::spawn(run_replication_worker(state.clone(), repl_rx));
    let maintenance = tokio::spawn(run_maintenance_loop(state.clone()));

    let bind = format!("{}:{}", options.address, options.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| DfsError::Fatal(format!("bind {}: {}", bind, e)))?;
    info!("chunk server {} listening on {}", options.server_id, bind);

    axum::serve(listener, chunk_router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| DfsError::Fatal(format!("serve: {}", e)))?;

    heartbeat.abort();
    replicator.abort();
    maintenance.abort();
    store.save_index().await?;
    info!("chunk server {} stopped", options.server_id);
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    if let Err(err) = run(options).await {
        error!("chunk server failed: {}", err);
        std::process::exit(1);
    }
}
