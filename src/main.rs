use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use offload::app::AppPackage;
use offload::config::{self, EngineConfig, PeerConfig};
use offload::demo::{self, Calculator};
use offload::engine::{Collaborators, Engine};
use offload::oracle::{ExecutionVerdict, TableOracle, UserChoiceOracle};
use offload::peer::PeerServer;
use offload::registry::SharedReceiver;
use offload::trace::{self, ExecutionTrace};

/// Offload: run method invocations locally or on a remote peer.
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(about = "Method-offloading engine and reference peer", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the calculator demo workload through the engine
    Demo {
        /// Peer as host:port[:secure_port]; starts a loopback peer when omitted
        #[arg(long)]
        peer: Option<String>,

        /// Engine config (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Application package to register; an in-memory stub is used when omitted
        #[arg(long)]
        app: Option<PathBuf>,

        /// Execution choice: LOCAL, REMOTE or DYNAMIC
        #[arg(long, default_value = "REMOTE")]
        choice: String,

        /// Number of accumulate calls
        #[arg(long, default_value_t = 5)]
        calls: u32,
    },

    /// Run the reference peer
    Peer {
        /// Peer config (YAML); overrides --bind and --apps-dir
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "0.0.0.0:4321")]
        bind: String,

        /// Directory uploaded applications are stored in
        #[arg(long, default_value = "offload-apps")]
        apps_dir: PathBuf,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli.command) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main(command: Command) -> Result<()> {
    match command {
        Command::Demo {
            peer,
            config,
            app,
            choice,
            calls,
        } => run_demo(peer, config, app, &choice, calls),
        Command::Peer {
            config,
            bind,
            apps_dir,
        } => {
            let cfg = match config {
                Some(path) => PeerConfig::load_from_file(&path)?,
                None => PeerConfig::new(bind, apps_dir),
            };
            let server = PeerServer::bind(&cfg, Arc::new(demo::registry()))?;
            server.serve()
        }
    }
}

fn run_demo(
    peer: Option<String>,
    config_path: Option<PathBuf>,
    app: Option<PathBuf>,
    choice: &str,
    calls: u32,
) -> Result<()> {
    let registry = Arc::new(demo::registry());

    let mut cfg = match config_path {
        Some(path) => EngineConfig::load_from_file(&path)?,
        None => {
            let mut cfg = EngineConfig::default();
            cfg.apply_env_overrides()?;
            cfg
        }
    };
    match peer {
        Some(raw) => cfg.peer = Some(config::parse_peer(&raw)?),
        None if cfg.peer.is_none() => {
            let apps_dir = std::env::temp_dir().join(format!("offload-demo-{}", std::process::id()));
            let server = PeerServer::bind(&PeerConfig::new("127.0.0.1:0", apps_dir), Arc::clone(&registry))?;
            cfg.peer = Some(server.descriptor("127.0.0.1")?);
            server.spawn()?;
            info!(peer = ?cfg.peer, "started loopback peer");
        }
        None => {}
    }

    let package = match app {
        Some(path) => AppPackage::from_file(&path)?,
        None => AppPackage::from_bytes("offload-demo", b"offload demo application".to_vec()),
    };

    let dynamic = Arc::new(
        TableOracle::new(ExecutionVerdict::Local)
            .with("accumulate", ExecutionVerdict::Remote)
            .with("add", ExecutionVerdict::Remote),
    );
    let oracle = Arc::new(UserChoiceOracle::new(dynamic));
    oracle.set_choice_str(choice);

    let recorder = Arc::new(ExecutionTrace::new());
    let collab = Collaborators::new(oracle).with_sink(recorder.clone());
    let engine = Engine::start(cfg, package, registry, collab).context("failed to start engine")?;

    let calc: SharedReceiver = Arc::new(std::sync::Mutex::new(Calculator::new(0)));
    let sum = engine
        .submit(Calculator::add(), vec![json!(2), json!(3)], Arc::clone(&calc))
        .into_result()
        .map_err(|err| anyhow!("add failed: {err}"))?;
    println!("add(2, 3) = {sum}");

    for i in 1..=calls {
        let total = engine
            .submit(Calculator::accumulate(), vec![json!(i)], Arc::clone(&calc))
            .into_result()
            .map_err(|err| anyhow!("accumulate failed: {err}"))?;
        println!("accumulate({i}) = {total}");
    }

    let outcome = engine.submit(Calculator::divide(), vec![json!(1), json!(0)], calc);
    println!("divide(1, 0) -> {}", serde_json::to_string(&outcome)?);

    engine.shutdown();
    engine.join();
    trace::print_trace(&recorder);
    Ok(())
}
