//! Edge Gateway - routes, authenticates and throttles traffic to a service fleet

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use edge_gateway::{
    cli::{Cli, Command},
    config::{Config, humantime_serde::parse_duration},
    gateway::{AuthGate, Gateway},
    routing::RouteTable,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Token {
            ref subject,
            ref ttl,
            ref claims,
        }) => run_token(&cli, subject, ttl, claims),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration and print the route table
fn run_check_config(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let table = match RouteTable::new(&config.routes) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("❌ Invalid routes: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = AuthGate::from_config(&config.auth) {
        eprintln!("❌ Invalid auth settings: {e}");
        return ExitCode::FAILURE;
    }

    println!("✅ Configuration OK ({} routes)\n", table.len());
    for route in table.routes() {
        let target = route
            .target()
            .map_or_else(|| "(not configured)".to_string(), ToString::to_string);
        println!(
            "  {:<24} {:<16} -> {target}  timeout={}s retries={}{}",
            route.prefix(),
            route.name(),
            route.timeout().as_secs(),
            route.max_retries(),
            if route.websocket_enabled() { " ws" } else { "" }
        );
    }
    ExitCode::SUCCESS
}

/// Sign a credential for operator use
fn run_token(cli: &Cli, subject: &str, ttl: &str, claims: &str) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let ttl = match parse_duration(ttl) {
        Ok(ttl) => ttl,
        Err(e) => {
            eprintln!("❌ Invalid --ttl '{ttl}': {e}");
            return ExitCode::FAILURE;
        }
    };
    let extra = match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(claims) {
        Ok(extra) => extra,
        Err(e) => {
            eprintln!("❌ --claims must be a JSON object: {e}");
            return ExitCode::FAILURE;
        }
    };

    match AuthGate::from_config(&config.auth).and_then(|gate| gate.issue(subject, ttl, extra)) {
        Ok(token) => {
            println!("{token}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to issue token: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.routes.len(),
        auth = config.auth.enabled,
        broker = ?config.broker.kind,
        "Starting Edge Gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
