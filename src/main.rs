mod bar;
mod config;
mod converter;
mod fhir_store;
mod identity;
mod inbound;
mod mapping;
mod mllp;
mod processor;
mod queue;
mod task;
mod validation;

use crate::config::{AppConfig, PreprocessorRegistry};
use crate::fhir_store::{FhirStore, HttpFhirStore};
use crate::processor::Poller;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let config = match AppConfig::new() {
        Ok(c) => c,
        Err(e) => panic!("Failed to parse app settings: {e:?}"),
    };
    let env = env_logger::Env::default().filter_or("RUST_LOG", config.log_level.clone());
    env_logger::init_from_env(env);

    let store: Arc<dyn FhirStore> = Arc::new(HttpFhirStore::new(config.fhir_base_url.clone()));
    let registry = Arc::new(PreprocessorRegistry::default());
    let config = Arc::new(config);
    let interval = Duration::from_secs(config.polling_interval_secs);

    let mllp_store = store.clone();
    let mllp_port = config.mllp_port;
    tokio::spawn(async move {
        if let Err(e) = mllp::run_listener(mllp_port, mllp_store).await {
            error!("MLLP listener terminated: {e}");
        }
    });

    let inbound_poller = Poller::new();
    {
        let store = store.clone();
        let config = config.clone();
        let registry = registry.clone();
        inbound_poller.start(
            interval,
            move || {
                let store = store.clone();
                let config = config.clone();
                let registry = registry.clone();
                Box::pin(async move { inbound::process_one(store.as_ref(), &config, &registry).await.map_err(anyhow::Error::from) })
            },
            || {},
            |e| error!("inbound processor tick failed: {e}"),
        );
    }

    let bar_builder_poller = Poller::new();
    {
        let store = store.clone();
        let config = config.clone();
        bar_builder_poller.start(
            interval,
            move || {
                let store = store.clone();
                let config = config.clone();
                Box::pin(async move { bar::builder::build_one(store.as_ref(), &config).await.map_err(anyhow::Error::from) })
            },
            || {},
            |e| error!("BAR builder tick failed: {e}"),
        );
    }

    let bar_sender_poller = Poller::new();
    {
        let store = store.clone();
        bar_sender_poller.start(
            interval,
            move || {
                let store = store.clone();
                Box::pin(async move { bar::sender::send_one(store.as_ref()).await.map_err(anyhow::Error::from) })
            },
            || {},
            |e| error!("BAR sender tick failed: {e}"),
        );
    }

    info!("hl7v2-to-fhir running: MLLP on {}, polling every {}s", config.mllp_port, config.polling_interval_secs);

    // the three pollers and the MLLP listener run for the lifetime of the
    // process; block here rather than returning and dropping their tasks.
    std::future::pending::<()>().await;
}
