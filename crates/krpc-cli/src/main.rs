//! # krpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Host the demo UserService
//! krpc provide -b 127.0.0.1:9000
//!
//! # Call it (outputs raw JSON)
//! krpc call -e 127.0.0.1:9000 getUserByUserId '[1]'
//!
//! # Spread calls over several providers
//! krpc call -e 127.0.0.1:9000 -e 127.0.0.1:9001 insertUserId '[{"id": 4, "name": "alan"}]'
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use krpc_cli::config::KrpcConfig;
use krpc_cli::demo::{user_service_interface, UserService, USER_SERVICE};
use krpc_client::{Dispatcher, ServiceProxy};
use krpc_common::protocol::{Endpoint, RequestEnvelope, Value};
use krpc_common::registry::StaticDiscovery;
use krpc_server::{RpcServer, ServiceProvider};
use std::path::Path;
use std::sync::Arc;

#[derive(FromArgs)]
/// krpc - RPC with consistent hashing, circuit breaking and rate limiting
struct Cli {
    /// path to the configuration file (defaults apply if it does not exist)
    #[argh(option, short = 'c', default = "\"krpc.toml\".into()")]
    config: String,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Provide(ProvideArgs),
    Call(CallArgs),
}

/// Hosts the demo `UserService`.
///
/// Rate limits and the idle timeout come from the `[server]` table of the
/// configuration file.
#[derive(FromArgs)]
#[argh(subcommand, name = "provide")]
/// host the demo UserService
struct ProvideArgs {
    /// address to bind to (overrides application host/port)
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

/// Makes a single call and prints the result as raw JSON to stdout.
///
/// Errors are reported to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a remote method
struct CallArgs {
    /// provider endpoint as host:port, repeatable (defaults to the configured application endpoint)
    #[argh(option, short = 'e', long = "endpoint")]
    endpoints: Vec<String>,

    /// interface to call
    #[argh(option, short = 'i', default = "USER_SERVICE.to_string()")]
    interface: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// JSON array of parameters
    #[argh(positional, default = "\"[]\".into()")]
    params: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` keeps stdout and stderr clean for piping into other tools
    if matches!(cli.command, Commands::Provide(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = KrpcConfig::load(Path::new(&cli.config))?;

    match cli.command {
        Commands::Provide(args) => run_provide(args, config).await,
        Commands::Call(args) => run_call(args, config).await,
    }
}

async fn run_provide(args: ProvideArgs, config: KrpcConfig) -> Result<()> {
    let bind = args
        .bind
        .unwrap_or_else(|| config.application.endpoint().to_string());

    let provider = Arc::new(ServiceProvider::new(config.server.rate_limiters()?));
    let server = RpcServer::bind(&bind, Arc::clone(&provider), config.server.clone()).await?;
    let endpoint = server.endpoint()?;
    provider
        .provide(Arc::new(UserService::with_sample_users()), &endpoint)
        .await?;

    tracing::info!(
        "{} {} serving {:?} on {}",
        config.application.name,
        config.application.version,
        provider.interface_names(),
        endpoint
    );

    let shutdown = server.shutdown_token();
    let running = server.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    running.await??;
    Ok(())
}

async fn run_call(args: CallArgs, config: KrpcConfig) -> Result<()> {
    let params: Vec<serde_json::Value> = serde_json::from_str(&args.params)
        .map_err(|e| anyhow::anyhow!("params must be a JSON array: {}", e))?;
    let params: Vec<Value> = params.into_iter().map(Value::from_json).collect();

    let endpoints = if args.endpoints.is_empty() {
        vec![config.application.endpoint()]
    } else {
        args.endpoints
            .iter()
            .map(|e| e.parse::<Endpoint>())
            .collect::<Result<Vec<_>, _>>()?
    };

    let discovery = Arc::new(StaticDiscovery::new(endpoints));
    let dispatcher = Arc::new(Dispatcher::new(discovery, config.client));

    let result = if args.interface == USER_SERVICE {
        let proxy = ServiceProxy::new(Arc::clone(&dispatcher), user_service_interface());
        proxy.call_value(&args.method, params).await
    } else {
        // Without an interface definition the method is not known to be idempotent
        let request = RequestEnvelope::new(args.interface.as_str(), args.method.as_str(), params);
        dispatcher.dispatch(&request, false).await
    };
    dispatcher.close().await?;

    println!("{}", serde_json::to_string(&result?.to_json())?);
    Ok(())
}
