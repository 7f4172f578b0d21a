mod api;
mod config;
mod errors;
mod logging;
mod ops;
mod runner;
mod security;
mod server;
mod session;
#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

use crate::api::registry::OpRegistry;
use crate::config::Config;
use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("terrapin.toml");
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("--config requires a path");
                    std::process::exit(2);
                }
                config_path = PathBuf::from(&args[i]);
            }
            _ => {}
        }
        i += 1;
    }

    let cfg = Config::load(&config_path).context("loading config")?;
    cfg.validate().context("validating config")?;

    let addr = format!("{}:{}", cfg.server.bind_addr, cfg.server.port);
    let registry = OpRegistry::new();

    info!(addr = %addr, base_path = %cfg.server.base_path, ops = ?registry.list_names(), "terrapin ready");
    println!(
        "terrapin ready addr={} base_path={} ops=[{}]",
        addr,
        cfg.server.base_path,
        registry.list_names().join(",")
    );

    server::serve(cfg, registry).await
}
