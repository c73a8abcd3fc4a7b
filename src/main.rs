use std::env;
use std::sync::Arc;

use rocket::routes;

mod arbiter;
mod config;
mod errors;
mod events;
mod fabric;
mod interlock;
mod lock_registry;
mod orchestrator_client;
mod params;
mod persistence;
mod reconciler;
mod remote_store_client;
mod rpc;
mod staging;
mod state_store;
mod types;

use arbiter::Arbiter;
use config::ArbiterConfig;
use interlock::DeviceBusyInterlock;
use persistence::InMemoryBackend;
use reconciler::Reconciler;
use rpc::node::NodeService;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = Arc::new(ArbiterConfig::read("arbiter-config.json").unwrap_or_else(|e| {
        log::warn!("failed to read arbiter-config.json ({e:?}), using defaults");
        ArbiterConfig::default()
    }));

    let locks = Arc::new(lock_registry::VolumeLockRegistry::new());
    let persistence_backend = Arc::new(InMemoryBackend::new());
    let store = Arc::new(state_store::AttachmentStateStore::new(persistence_backend));
    let restored = store.rebuild_from_persistence().await?;
    log::info!("restored {restored} volume(s) from persisted state on startup");

    let orchestrator = match &config.orchestrator_base_url {
        Some(base_url) => orchestrator_client::http(base_url.clone()),
        None => orchestrator_client::fake(),
    };
    let remote_store = remote_store_client::permissive();
    let events = events::recording();

    let arbiter = Arc::new(Arbiter::new(
        config.clone(),
        locks.clone(),
        store.clone(),
        orchestrator.clone(),
        remote_store,
        events.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        config.clone(),
        locks,
        store,
        orchestrator,
        events.clone(),
    ));
    {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            reconciler.start().await;
        });
    }

    let node_service = Arc::new(NodeService {
        staging: Arc::new(staging::UnimplementedStagingClient),
        fabric: Arc::new(fabric::UnimplementedFabricClient),
        interlock: Arc::new(DeviceBusyInterlock::new(
            Box::new(interlock::UnimplementedDeviceInspector),
            events,
            &config,
        )),
    });

    let _rocket = rocket::build()
        .configure(rocket::Config {
            address: config.address.parse()?,
            port: config.port,
            ..Default::default()
        })
        .manage(arbiter)
        .manage(config)
        .manage(node_service)
        .manage(reconciler)
        .mount(
            "/",
            routes![
                rpc::controller::controller_publish,
                rpc::controller::controller_unpublish,
                rpc::node::node_stage,
                rpc::node::node_unstage,
                rpc::admin::force_reconcile,
            ],
        )
        .launch()
        .await?;

    Ok(())
}
