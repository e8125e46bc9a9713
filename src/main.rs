//! connect-probe
//!
//! A CLI tool for checking connectivity through an HTTP CONNECT proxy.
//!
//! The probe opens a mutual-TLS session to the proxy, asks it to CONNECT to a
//! target service, then runs exactly one request over the tunnel:
//! - a unary gRPC `hello.Greeter/SayHello` call
//! - an HTTP `GET` over HTTP/1.1 or HTTP/2
//!
//! The demo target services are bundled as `serve-grpc` and `serve-http`.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod proto;
mod service;
#[cfg(test)]
mod testing;
mod tls;
mod tunnel;

use client::{GrpcProbe, HttpProbe};
use config::{Config, GrpcOptions, HttpOptions, ProxyArgs, ProxyOptions};
use service::greeter::HelloGreeter;
use tunnel::Authority;

#[derive(Parser, Debug)]
#[command(name = "connect-probe")]
#[command(author, version, about = "Check connectivity through an HTTP CONNECT proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call hello.Greeter/SayHello through the proxy
    Grpc(GrpcArgs),

    /// GET an HTTP endpoint through the proxy
    Http(HttpArgs),

    /// Run the demo gRPC greeter service
    ServeGrpc(ServeGrpcArgs),

    /// Run the demo HTTP hello service
    ServeHttp(ServeHttpArgs),
}

#[derive(Args, Debug)]
struct GrpcArgs {
    #[command(flatten)]
    proxy: ProxyArgs,

    /// The host of the request server
    #[arg(long, default_value = "localhost")]
    request_host: String,

    /// The port the request server is listening on
    #[arg(long, default_value_t = 8000)]
    request_port: u16,

    /// Client name to send in the greeting request
    #[arg(long, default_value = "test-client")]
    request_client_name: String,
}

#[derive(Args, Debug)]
struct HttpArgs {
    #[command(flatten)]
    proxy: ProxyArgs,

    /// The URL to GET through the tunnel
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    request_endpoint: String,

    /// Speak HTTP/2 (prior knowledge) over the tunnel
    #[arg(long)]
    http2: bool,
}

#[derive(Args, Debug)]
struct ServeGrpcArgs {
    /// IP address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = 50051)]
    port: u16,
}

#[derive(Args, Debug)]
struct ServeHttpArgs {
    /// IP address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Grpc(args) => until_interrupted(run_grpc(args, config_path)).await,
        Commands::Http(args) => until_interrupted(run_http(args, config_path)).await,
        Commands::ServeGrpc(args) => run_serve_grpc(args).await,
        Commands::ServeHttp(args) => run_serve_http(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_grpc(args: GrpcArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let options = GrpcOptions {
        proxy: ProxyOptions::resolve(&args.proxy, &config.proxy),
        target: Authority::new(args.request_host, args.request_port),
        client_name: args.request_client_name,
    };
    options.log();
    options
        .validate()
        .context("failed to validate proxy client options")?;

    let probe = GrpcProbe::new(options.target.clone(), options.client_name.clone());
    client::execute(&probe, &options.proxy).await?;
    Ok(())
}

async fn run_http(args: HttpArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let proxy = ProxyOptions::resolve(&args.proxy, &config.proxy);
    let options = HttpOptions::resolve(proxy, &args.request_endpoint, args.http2)
        .context("failed to validate proxy client options")?;
    options.log();
    options
        .validate()
        .context("failed to validate proxy client options")?;

    client::execute(&HttpProbe::from_options(&options), &options.proxy).await?;
    Ok(())
}

async fn run_serve_grpc(args: ServeGrpcArgs) -> Result<()> {
    let listener = service::bind(&args.address, args.port).await?;
    service::greeter::serve(listener, HelloGreeter, shutdown_signal()).await
}

async fn run_serve_http(args: ServeHttpArgs) -> Result<()> {
    let listener = service::bind(&args.address, args.port).await?;
    service::hello::serve(listener, shutdown_signal()).await
}

/// Run a probe, giving up if the user hits Ctrl+C first.
async fn until_interrupted<F>(probe: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = probe => result,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down...");
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
