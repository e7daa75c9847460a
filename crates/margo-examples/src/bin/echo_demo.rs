//! End-to-end demonstration of the runtime: a server `Instance`
//! registers an `echo` RPC, a client `Instance` forwards to it over
//! `LoopbackTransport`, and the response is printed. Mirrors
//! `docs/examples/margo/01_init` in the original mochi-margo sources.

use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use margo::{HandlerContext, Instance, RpcHandler};
use margo_transport::loopback::LoopbackTransport;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-demo", about = "Margo echo RPC demonstration")]
struct Args {
    /// Message the client sends to the server's `echo` RPC.
    #[arg(long, default_value = "hello")]
    message: String,

    /// Path to a MargoConfig document (JSON or YAML). Falls back to
    /// MARGO_CONFIG_PATH, then built-in defaults.
    #[arg(long, env = "MARGO_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,
}

struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn handle(&self, ctx: HandlerContext) {
        let message: String = match serde_json::from_slice(&ctx.payload) {
            Ok(m) => m,
            Err(e) => {
                let _ = ctx
                    .instance
                    .respond_error(ctx.handle, margo::ErrorKind::InvalidArgument, e.to_string())
                    .await;
                return;
            }
        };
        info!(%message, "echo handler invoked");
        let _ = ctx.instance.respond(ctx.handle, &message).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => margo_config::MargoConfig::from_file(path)?,
        None => margo_config::MargoConfig::from_env_or_default()?,
    };

    let server_transport = LoopbackTransport::new("echo-server");
    let server = Instance::init(&config, server_transport, None, true)?;
    server.register("echo", EchoHandler)?;
    info!("server instance listening on \"echo-server\"");

    let client_transport = LoopbackTransport::new("echo-client");
    let client = Instance::init(&config, client_transport, None, false)?;

    let response: String = client
        .forward("echo-server", "echo", margo::NO_PROVIDER, &args.message, Some(Duration::from_secs(5)))
        .await?;
    println!("{response}");

    client.finalize_and_wait();
    server.finalize_and_wait();
    Ok(())
}
