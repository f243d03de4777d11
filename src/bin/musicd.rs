use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use music::api::{self, ApiState};
use music::config::Config;
use music::dns::client::{ClientTimeouts, DnsNetworkClient};
use music::engine::{Engine, ShutdownCoordinator};
use music::logging;
use music::signer::ddns::DdnsBackend;
use music::signer::hosted::HostedBackend;
use music::signer::{DnsParent, Gateway, QueueLimits, RateLimited, METHOD_RL_DDNS, METHOD_RL_HOSTED};
use music::store::Store;

/// Multi-signer DNSSEC controller daemon
#[derive(Parser)]
#[command(name = "musicd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "MUSICD_CONFIG", default_value = "/etc/music/musicd.yaml")]
    config: String,

    /// Do not run the scheduler; zones only move when stepped
    #[arg(long)]
    passive: bool,
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn fail(msg: String) -> ! {
    log::error!("{}", msg);
    eprintln!("musicd: {}", msg);
    process::exit(1)
}

fn build_gateway(config: &Config, store: &Store, client: DnsNetworkClient, shutdown: &ShutdownCoordinator) -> Gateway {
    let signers = &config.signers;
    let mut gateway = Gateway::new(store.clone());

    let ddns = Arc::new(DdnsBackend::new(client));
    gateway.register(ddns.clone());
    gateway.register(Arc::new(RateLimited::new(
        METHOD_RL_DDNS,
        ddns,
        QueueLimits {
            fetch_per_sec: signers.ddns.fetch_limit,
            update_per_sec: signers.ddns.update_limit,
            throttle_retries: signers.throttle_retries,
        },
        Some(shutdown),
    )));

    match HostedBackend::new(signers.hosted.clone(), store.clone()) {
        Ok(hosted) => {
            let hosted = Arc::new(hosted);
            gateway.register(hosted.clone());
            gateway.register(Arc::new(RateLimited::new(
                METHOD_RL_HOSTED,
                hosted,
                QueueLimits {
                    fetch_per_sec: signers.hosted.fetch_limit,
                    update_per_sec: signers.hosted.update_limit,
                    throttle_retries: signers.throttle_retries,
                },
                Some(shutdown),
            )));
        }
        Err(e) => log::warn!("Hosted signer backend unavailable: {}", e),
    }
    gateway
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("musicd: {}", e);
            process::exit(1);
        }
    };
    if args.passive {
        config.fsmengine.active = false;
    }
    logging::init(&config.log);
    log::info!("musicd {} starting with {}", env!("CARGO_PKG_VERSION"), args.config);

    if config.apiserver.apikey.is_empty() {
        fail("apiserver.apikey must be set".to_string());
    }
    let addr: SocketAddr = match config.apiserver.address.parse() {
        Ok(addr) => addr,
        Err(e) => fail(format!(
            "apiserver.address '{}' is not an address:port pair: {}",
            config.apiserver.address, e
        )),
    };

    let store = match Store::open(&config.db.file).await {
        Ok(store) => store,
        Err(e) => fail(format!("cannot open database {}: {}", config.db.file, e)),
    };

    let shutdown = Arc::new(ShutdownCoordinator::new(DRAIN_TIMEOUT));
    let client = DnsNetworkClient::new(ClientTimeouts {
        query: Duration::from_secs(config.signers.ddns.fetch_timeout),
        update: Duration::from_secs(config.signers.ddns.update_timeout),
    });
    let gateway = build_gateway(&config, &store, client.clone(), &shutdown);
    let parent = Arc::new(DnsParent::new(client));

    let engine = Engine::start(
        store.clone(),
        gateway,
        parent,
        config.fsmengine.clone(),
        Some(&shutdown),
    );

    let state = Arc::new(ApiState {
        engine,
        apikey: config.apiserver.apikey.clone(),
    });
    if let Err(e) = api::spawn(addr, state, Some(&shutdown)) {
        fail(format!("cannot serve the control plane on {}: {}", addr, e));
    }

    if let Err(e) = shutdown.clone().install_signal_handlers().await {
        log::error!("Signal handler task failed: {}", e);
    }
    store.close().await;
    log::info!("musicd stopped");
}
