use anyhow::{bail, Context, Result};
use clap::Parser;
use corral::{Config, Engine};
use log::debug;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};

fn init_logging(config: &Config) -> Result<()> {
    // DEBUG=1 in the environment wins over the configured level
    let level = if env::var("DEBUG").map(|v| v == "1").unwrap_or(false) {
        log::LevelFilter::Debug
    } else {
        config.log_level()
    };
    env::set_var("RUST_LOG", format!("corral={}", level));
    env_logger::try_init().context("init env logger")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config)?;

    let engine = Engine::new(
        config.policy().context("assemble security policy")?,
        config.engine_options(),
    )
    .context("initialize engine")?;

    if config.stdin_mode() {
        run_line_protocol(&engine).await
    } else {
        run_one_shot(&engine, &config).await
    }
}

/// Dispatch the single command given on the command line.
async fn run_one_shot(engine: &Engine, config: &Config) -> Result<()> {
    let target = match config.target() {
        Some(target) => target,
        None => bail!("a target is required; try `corral docker \"list\"` or --stdin"),
    };
    let line = config.command().join(" ");
    let result = engine.dispatch(target, &line).await;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

/// Read `<target> <command...>` lines from stdin, one JSON result per line.
async fn run_line_protocol(engine: &Engine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (target, command) = match trimmed.split_once(char::is_whitespace) {
            Some(split) => split,
            None => (trimmed, ""),
        };
        debug!("Dispatching {:?} against {}", command, target);
        let result = engine.dispatch(target, command.trim()).await;
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}
