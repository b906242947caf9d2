use std::env;
use std::process::exit;

use log::error;
use syrinx_protocol::client::{DaemonClientBuilder, UnixDaemonClient};
use syrinx_protocol::ProtocolError;
use syrinx_store_core::StorePath;

const USAGE: &str = "usage: syrinx [--socket PATH] <command> [args]

commands:
  ping                      connect and print the negotiated version
  is-valid-path <path>      check whether a store path is valid
  path-info <path>          print metadata of a store path
  find-roots                list garbage collector roots
";

struct Options {
    socket_path: Option<String>,
    command: Vec<String>,
}

fn parse_args(mut args: Vec<String>) -> Option<Options> {
    let mut socket_path = None;
    if args.first().map(String::as_str) == Some("--socket") {
        if args.len() < 2 {
            return None;
        }
        socket_path = Some(args.remove(1));
        args.remove(0);
    }
    if args.is_empty() {
        return None;
    }
    Some(Options {
        socket_path,
        command: args,
    })
}

async fn connect(options: &Options) -> Result<UnixDaemonClient, ProtocolError> {
    let mut builder = DaemonClientBuilder::new();
    if let Some(path) = &options.socket_path {
        builder = builder.socket_path(path);
    }
    builder.connect().await
}

fn parse_store_path(
    client: &UnixDaemonClient,
    arg: &str,
) -> Result<StorePath, ProtocolError> {
    if arg.starts_with('/') {
        client
            .store_dir()
            .parse_path(arg)
            .map_err(|e| ProtocolError::BadStorePath(e.to_string()))
    } else {
        StorePath::from_base_name(arg).map_err(|e| ProtocolError::BadStorePath(e.to_string()))
    }
}

async fn run(options: Options) -> Result<i32, ProtocolError> {
    let mut client = connect(&options).await?;
    let command: Vec<&str> = options.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["ping"] => {
            let info = client.handshake_info().clone();
            println!(
                "connected: protocol {}, daemon {}",
                client.version(),
                info.daemon_version.as_deref().unwrap_or("<unknown>")
            );
            Ok(0)
        }
        ["is-valid-path", path] => {
            let path = parse_store_path(&client, path)?;
            let valid = client.is_valid_path(&path).await?;
            println!("{valid}");
            Ok(if valid { 0 } else { 1 })
        }
        ["path-info", path] => {
            let path = parse_store_path(&client, path)?;
            match client.query_path_info(&path).await? {
                Some(info) => {
                    println!("path: {}", client.store_dir().display_path(&path));
                    println!("nar-hash: {}", info.nar_hash.to_prefixed_hex());
                    println!("nar-size: {}", info.nar_size);
                    for reference in &info.references {
                        println!("reference: {}", client.store_dir().display_path(reference));
                    }
                    if let Some(deriver) = &info.deriver {
                        println!("deriver: {}", client.store_dir().display_path(deriver));
                    }
                    for sig in &info.sigs {
                        println!("sig: {sig}");
                    }
                    Ok(0)
                }
                None => {
                    eprintln!("path is not valid");
                    Ok(1)
                }
            }
        }
        ["find-roots"] => {
            for (link, target) in client.find_roots().await? {
                println!("{link} -> {}", client.store_dir().display_path(&target));
            }
            Ok(0)
        }
        _ => {
            eprint!("{USAGE}");
            Ok(2)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let Some(options) = parse_args(env::args().skip(1).collect()) else {
        eprint!("{USAGE}");
        exit(2);
    };
    match run(options).await {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
