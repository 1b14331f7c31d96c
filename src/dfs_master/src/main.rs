use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use dfs_lib::{Config, DfsResult, KeyManager};
use dfs_master::{master_router, spawn_background_tasks, ChunkAllocator, MasterState, MetadataManager};

const METADATA_FILE: &str = "master_metadata.json";

fn usage() -> String {
    "usage: dfs_master <address> <port> [--config <path>]".to_string()
}

struct MasterOptions {
    address: String,
    port: u16,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Result<MasterOptions, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let address = args[0].clone();
    let port: u16 = args[1]
        .parse()
        .map_err(|e| format!("invalid port {}: {}\n{}", args[1], e, usage()))?;

    let mut config_path = None;
    let mut i = 2usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            other => return Err(format!("unknown argument: {}\n{}", other, usage())),
        }
        i += 1;
    }

    Ok(MasterOptions {
        address,
        port,
        config_path,
    })
}

async fn run(options: MasterOptions) -> DfsResult<()> {
    let config = match &options.config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    let data_dir = PathBuf::from(&config.data_directory);
    std::fs::create_dir_all(&data_dir).map_err(|e| {
        dfs_lib::DfsError::Fatal(format!("create {}: {}", data_dir.to_string_lossy(), e))
    })?;

    let meta = Arc::new(MetadataManager::open(data_dir.join(METADATA_FILE))?);
    let allocator = Arc::new(ChunkAllocator::new(meta.clone(), &config));
    let keys = Arc::new(KeyManager::new());

    let state = MasterState {
        meta: meta.clone(),
        allocator: allocator.clone(),
        keys,
        config: config.clone(),
    };

    let handles = spawn_background_tasks(meta.clone(), allocator, config);

    let bind = format!("{}:{}", options.address, options.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| dfs_lib::DfsError::Fatal(format!("bind {}: {}", bind, e)))?;
    info!("master listening on {}", bind);

    axum::serve(listener, master_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| dfs_lib::DfsError::Fatal(format!("serve: {}", e)))?;

    for handle in handles {
        handle.abort();
    }
    meta.save()?;
    info!("metadata saved, master stopped");
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
        error!("master failed: {}", err);
        std::process::exit(1);
    }
}
