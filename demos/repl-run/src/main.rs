//! Run code in a bridged interpreter session.
//!
//! Run with: cargo run -p repl-run -- [--lang r] [--dir DIR] [--mode plain|image|markup] [--headless] [CODE...]
//!
//! Each CODE argument is submitted as one request; without any, stdin is
//! read as a single request. The session's live view is mirrored to stderr
//! and every resulting event is printed to stdout as one JSON line.

use std::{io::Read as _, path::PathBuf, time::Duration};

use anyhow::{Context as _, bail};
use futures::StreamExt;
use repl_bridge_core::{BridgeConfig, CaptureMode, ProcessSpawner, ViewMsg};
use repl_bridge_session::{SessionError, SessionManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    language: String,
    dir: PathBuf,
    mode: Option<CaptureMode>,
    headless: bool,
    code: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        language: "r".into(),
        dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        mode: None,
        headless: false,
        code: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--lang" => args.language = it.next().context("--lang needs a value")?,
            "--dir" => args.dir = it.next().context("--dir needs a value")?.into(),
            "--mode" => {
                let mode = it.next().context("--mode needs a value")?;
                args.mode = Some(mode.parse().map_err(anyhow::Error::msg)?);
            }
            "--headless" => args.headless = true,
            "-h" | "--help" => {
                eprintln!(
                    "usage: repl-run [--lang r] [--dir DIR] [--mode plain|image|markup] [--headless] [CODE...]"
                );
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => args.code.push(arg),
        }
    }
    if args.code.is_empty() {
        let mut stdin = String::new();
        std::io::stdin().read_to_string(&mut stdin)?;
        args.code.push(stdin);
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let config = BridgeConfig::load()?;
    if args.headless {
        run(SessionManager::with_pipes(config), &args).await
    } else {
        run(SessionManager::with_pty(config), &args).await
    }
}

async fn run<P: ProcessSpawner>(manager: SessionManager<P>, args: &Args) -> anyhow::Result<()> {
    let session = manager
        .acquire_for(&args.language, &args.dir)
        .await
        .context("failed to start session")?;

    let mut view = manager.subscribe_view(&session);
    let mirror = tokio::spawn(async move {
        while let Some(msg) = view.next().await {
            match msg {
                ViewMsg::Output { text } => eprint!("{text}"),
                ViewMsg::Exited { code } => {
                    eprintln!("\n[session exited: {code:?}]");
                    break;
                }
            }
        }
    });

    let mut failed = false;
    for code in &args.code {
        let events = match manager.submit(&session, code, args.mode).await {
            Ok(events) => events,
            Err(SessionError::ExecutionTimeout { events, timeout, .. }) => {
                tracing::warn!(?timeout, "Request timed out, printing partial events");
                failed = true;
                events
            }
            Err(e) => {
                manager.shutdown().await;
                return Err(e.into());
            }
        };
        for event in events {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    manager.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), mirror).await;
    if failed {
        bail!("one or more requests timed out");
    }
    Ok(())
}
