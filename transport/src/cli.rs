//! sdctl コマンドライン
//!
//! サービスの登録（serve）・解決（resolve / pick）・監視（watch）を行う。

use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use service_discovery::store::CoordinationStore;
use service_discovery::{
    DiscoveryConfig, DiscoveryError, DiscoveryResult, EndPointInstance, Registry, RegistryOptions,
    ServiceInstance,
};

use crate::client::Client;
use crate::health::HealthOptions;
use crate::server::Server;

/// Service discovery command-line tool
#[derive(Parser, Debug)]
#[command(name = "sdctl")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    DISCOVERY_NAMESPACE                   Key namespace (default: /services)
    DISCOVERY_TTL_SECS                    Registration lease TTL (default: 15)
    DISCOVERY_HEALTH_CHECK_INTERVAL_SECS  Health check interval (default: 60)
    DISCOVERY_PROBE_TIMEOUT_SECS          Endpoint probe timeout (default: 3)
    DISCOVERY_ETCD_ENDPOINTS              Comma-separated etcd endpoints
    RUST_LOG                              Log filter (default: info)
"#)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register an instance and keep it healthy until interrupted
    Serve(ServeArgs),
    /// List every endpoint of a service
    Resolve(ServiceArgs),
    /// Pick one endpoint by weight
    Pick(ServiceArgs),
    /// Print the endpoint list whenever the service changes
    Watch(ServiceArgs),
}

/// serve サブコマンドの引数
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Service name
    #[arg(short, long)]
    pub name: String,

    /// Instance id (random UUID if omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Endpoint as host:port[=weight] (repeatable)
    #[arg(short, long = "endpoint", value_parser = parse_endpoint, required = true)]
    pub endpoints: Vec<EndPointInstance>,
}

/// サービス名のみを取るサブコマンドの引数
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Service name
    pub name: String,
}

/// `host:port[=weight]` を解析する（重み省略時は1）
pub fn parse_endpoint(value: &str) -> Result<EndPointInstance, String> {
    let (addr, weight) = match value.rsplit_once('=') {
        Some((addr, weight)) => {
            let weight: i32 = weight
                .parse()
                .map_err(|_| format!("invalid weight in '{}'", value))?;
            (addr, weight)
        }
        None => (value, 1),
    };

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
        _ => return Err(format!("expected host:port, got '{}'", addr)),
    }

    let endpoint = EndPointInstance::new(addr, weight);
    endpoint.validate().map_err(|e| e.to_string())?;
    Ok(endpoint)
}

/// サブコマンドを実行する
///
/// `shutdown` が完了すると serve / watch は終了する。
pub async fn execute<F>(
    command: Commands,
    config: &DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    shutdown: F,
) -> DiscoveryResult<()>
where
    F: Future<Output = ()>,
{
    let registry = Arc::new(Registry::new(store, RegistryOptions::from_config(config)));

    match command {
        Commands::Serve(args) => serve(args, config, registry, shutdown).await,
        Commands::Resolve(args) => {
            let client = Client::new(ServiceInstance::new("sdctl"), registry);
            for endpoint in client.get_endpoints(&args.name).await? {
                println!("{}", format_endpoint(&endpoint));
            }
            Ok(())
        }
        Commands::Pick(args) => {
            let client = Client::new(ServiceInstance::new("sdctl"), registry);
            let endpoint = client.pick_one_endpoint(&args.name).await?;
            println!("{}", endpoint.endpoint);
            Ok(())
        }
        Commands::Watch(args) => watch(args, registry, shutdown).await,
    }
}

async fn serve<F>(
    args: ServeArgs,
    config: &DiscoveryConfig,
    registry: Arc<Registry>,
    shutdown: F,
) -> DiscoveryResult<()>
where
    F: Future<Output = ()>,
{
    let mut instance = match args.id {
        Some(id) => ServiceInstance::with_id(id, args.name),
        None => ServiceInstance::new(args.name),
    };
    instance.endpoints = args.endpoints;
    instance.validate_weights()?;

    let token = CancellationToken::new();
    let server = Server::new(
        token.clone(),
        instance,
        registry,
        HealthOptions::from_config(config),
    );
    if let Err(e) = server.register().await {
        token.cancel();
        return Err(e);
    }
    info!(
        service = %server.instance().name,
        instance_id = %server.instance().id,
        "Serving until interrupted"
    );

    shutdown.await;
    let result = server.shutdown().await;
    token.cancel();
    result
}

async fn watch<F>(args: ServiceArgs, registry: Arc<Registry>, shutdown: F) -> DiscoveryResult<()>
where
    F: Future<Output = ()>,
{
    let token = CancellationToken::new();
    let watcher = registry.watcher(&args.name);
    let mut stream = watcher.watch(&token).await?;
    let client = Client::new(ServiceInstance::new("sdctl"), registry);

    print_snapshot(&client, &args.name).await?;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = stream.recv() => match changed {
                Some(()) => print_snapshot(&client, &args.name).await?,
                None => {
                    let reason = stream.close_reason();
                    return Err(DiscoveryError::StoreRead(format!(
                        "watch closed: {:?}",
                        reason
                    )));
                }
            }
        }
    }

    watcher.stop();
    token.cancel();
    Ok(())
}

async fn print_snapshot(client: &Client, name: &str) -> DiscoveryResult<()> {
    let endpoints = client.get_endpoints(name).await?;
    println!("# {} ({} endpoints)", name, endpoints.len());
    for endpoint in &endpoints {
        println!("{}", format_endpoint(endpoint));
    }
    Ok(())
}

fn format_endpoint(endpoint: &EndPointInstance) -> String {
    format!(
        "{}\tweight={}\thealthy_at={}",
        endpoint.endpoint, endpoint.weight, endpoint.healthy_at
    )
}
