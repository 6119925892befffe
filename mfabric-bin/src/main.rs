#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use mfabric::auth::{MemoryPolicyOracle, MemoryThingRepository};
use mfabric::broker::{Broker, MemoryBroker};
use mfabric::conf::{Options, Settings};
use mfabric::context::Substrate;
use mfabric::logger::logger_init;
use mfabric::routemap::KvStore;
use mfabric_bridge_lora::LoraBridge;
use mfabric_broker_nats::NatsBroker;

use egress::BrokerEgress;

mod egress;

#[tokio::main]
async fn main() {
    //init config
    let settings = Settings::new(Options::from_args()).expect("settings init failed");

    //init log
    let _logger = logger_init(&settings.log).expect("logger init failed");

    let startups = &settings.plugins.default_startups;
    let memory = Arc::new(MemoryBroker::new());
    let broker: Arc<dyn Broker> = if startups.iter().any(|s| s == mfabric_broker_nats::NAME) {
        Arc::new(NatsBroker::from_settings(&settings).expect("nats broker init failed"))
    } else {
        memory.clone()
    };

    let substrate = Substrate::new(
        settings.clone(),
        broker.clone(),
        memory,
        Arc::new(MemoryPolicyOracle::new()),
        Arc::new(MemoryThingRepository::new()),
        route_store(),
    );

    //register bridges
    if startups.iter().any(|s| s == mfabric_bridge_lora::NAME) {
        let egress = Arc::new(BrokerEgress::new(broker, mfabric_bridge_lora::PROTOCOL));
        let lora = LoraBridge::from_settings(&settings, egress).expect("lora bridge init failed");
        substrate.bridges().register(Arc::new(lora)).await.expect("register lora bridge failed");
    }

    if let Err(e) = substrate.start().await {
        log::error!("substrate start failed, {e}");
        substrate.stop().await;
        std::process::exit(1);
    }
    log::info!("{}", substrate.to_json().await);

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("waiting for ctrl-c failed, {e}");
    }
    log::info!("shutting down");
    substrate.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(feature = "sled")]
fn route_store() -> Arc<dyn KvStore> {
    Arc::new(mfabric::routemap::SledStore::open("./data/routemap", "routes").expect("route map store open failed"))
}

#[cfg(not(feature = "sled"))]
fn route_store() -> Arc<dyn KvStore> {
    Arc::new(mfabric::routemap::MemoryStore::new())
}
