use chrono::{Local, TimeZone};
use std::path::PathBuf;

use dfs_client::DfsClient;
use dfs_lib::{Config, DfsResult, FileInfo};

fn usage() -> String {
    "usage: dfs_client [--config <path>] <command> [args]\n\
     commands:\n\
       put <local> <remote> [--no-encryption] [--erasure-coding]\n\
       get <remote> <local>\n\
       delete <remote>\n\
       list [prefix]\n\
       info <remote>\n\
       stats\n\
       verbose <on|off>\n\
       cache [size-mb]"
        .to_string()
}

struct CliOptions {
    config_path: Option<PathBuf>,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> Result<CliOptions, String> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            return Err("missing value for --config".to_string());
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }

    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }
    let command = args.remove(0);
    Ok(CliOptions {
        config_path,
        command,
        args,
    })
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

fn format_time(ms: u64) -> String {
    Local
        .timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_file_row(file: &FileInfo) {
    println!(
        "{:<30} {:>12} {:<20} {:<10} {:<5}",
        file.filename,
        format_size(file.size),
        format_time(file.created_time),
        if file.is_encrypted { "encrypted" } else { "plain" },
        if file.is_erasure_coded { "EC" } else { "R" },
    );
}

async fn run_command(options: CliOptions) -> DfsResult<()> {
    let config = match &options.config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    let mut client = DfsClient::new(config);
    let args = &options.args;
    let invalid =
        |msg: &str| Err(dfs_lib::DfsError::InvalidArgument(format!("{}\n{}", msg, usage())));

    match options.command.as_str() {
        "put" => {
            if args.len() < 2 {
                return invalid("put needs <local> <remote>");
            }
            let local = PathBuf::from(&args[0]);
            let remote = args[1].clone();
            let mut encryption = client.config().encryption_enabled;
            let mut erasure_coding = client.config().erasure_coding_enabled;
            for flag in &args[2..] {
                match flag.as_str() {
                    "--no-encryption" => encryption = false,
                    "--erasure-coding" => erasure_coding = true,
                    other => return invalid(&format!("unknown put option {}", other)),
                }
            }
            client.set_upload_progress(Box::new(progress_line));
            client.put(&local, &remote, encryption, erasure_coding).await?;
            println!("uploaded {} to {}", local.to_string_lossy(), remote);
        }
        "get" => {
            if args.len() != 2 {
                return invalid("get needs <remote> <local>");
            }
            let remote = args[0].clone();
            let local = PathBuf::from(&args[1]);
            client.set_download_progress(Box::new(progress_line));
            client.get(&remote, &local).await?;
            println!("downloaded {} to {}", remote, local.to_string_lossy());
        }
        "delete" => {
            if args.len() != 1 {
                return invalid("delete needs <remote>");
            }
            client.delete(&args[0]).await?;
            println!("deleted {}", args[0]);
        }
        "list" => {
            let prefix = args.first().map(String::as_str).unwrap_or("");
            let files = client.list(prefix).await?;
            if files.is_empty() {
                println!("no files found");
            } else {
                for file in &files {
                    print_file_row(file);
                }
            }
        }
        "info" => {
            if args.len() != 1 {
                return invalid("info needs <remote>");
            }
            let file = client.info(&args[0]).await?;
            println!("name:      {}", file.filename);
            println!("size:      {}", format_size(file.size));
            println!("created:   {}", format_time(file.created_time));
            println!("modified:  {}", format_time(file.modified_time));
            println!("encrypted: {}", if file.is_encrypted { "yes" } else { "no" });
            println!(
                "erasure:   {}",
                if file.is_erasure_coded {
                    format!("yes (k={}, m={})", file.ec_data_blocks, file.ec_parity_blocks)
                } else {
                    "no".to_string()
                }
            );
            println!("chunks:    {}", file.chunks.len());
            for chunk in &file.chunks {
                println!(
                    "  {} ({}) on {}",
                    chunk.chunk_id,
                    format_size(chunk.size),
                    chunk.server_addresses.join(", ")
                );
            }
        }
        "stats" => {
            let cache = client.cache_stats();
            println!(
                "cache: {} entries, {} / {} used, hit rate {:.1}%",
                cache.entries,
                format_size(cache.total_bytes as u64),
                format_size(cache.capacity_bytes as u64),
                cache.hit_rate() * 100.0
            );
            match client.cluster_stats().await {
                Ok(stats) => {
                    println!(
                        "cluster: {} files, {} chunks, {}/{} healthy servers",
                        stats.total_files,
                        stats.total_chunks,
                        stats.healthy_servers,
                        stats.total_servers
                    );
                    println!(
                        "storage: {} used, {} available, avg replication {:.2}",
                        format_size(stats.total_storage_used),
                        format_size(stats.total_storage_available),
                        stats.average_replication_factor
                    );
                }
                Err(e) => println!("cluster stats unavailable: {}", e),
            }
        }
        "verbose" => {
            match args.first().map(String::as_str) {
                Some("on") => {
                    log::set_max_level(log::LevelFilter::Debug);
                    println!("verbose logging enabled");
                }
                Some("off") => {
                    log::set_max_level(log::LevelFilter::Warn);
                    println!("verbose logging disabled");
                }
                _ => return invalid("verbose needs on|off"),
            }
        }
        "cache" => match args.first() {
            Some(size) => {
                let size_mb: usize = size.parse().map_err(|e| {
                    dfs_lib::DfsError::InvalidArgument(format!("invalid cache size {}: {}", size, e))
                })?;
                client.set_cache_size_mb(size_mb);
                println!("cache size set to {} MB", size_mb);
            }
            None => {
                let stats = client.cache_stats();
                println!(
                    "cache: {} entries, {} / {} used, {} hits, {} misses",
                    stats.entries,
                    format_size(stats.total_bytes as u64),
                    format_size(stats.capacity_bytes as u64),
                    stats.hits,
                    stats.misses
                );
            }
        },
        other => return invalid(&format!("unknown command {}", other)),
    }
    Ok(())
}

fn progress_line(current: u64, total: u64) {
    if total == 0 {
        return;
    }
    let percent = current as f64 / total as f64 * 100.0;
    eprint!(
        "\r{} / {} ({:.1}%)",
        format_size(current),
        format_size(total),
        percent
    );
    if current >= total {
        eprintln!();
    }
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
    if let Err(err) = run_command(options).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_format_with_binary_units() {
        assert_eq!(format_size(0), "0.0 B");
        assert_eq!(format_size(1023), "1023.0 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
