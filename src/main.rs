use actix_web::web::Data as WebData;
use actix_web::{get, App, HttpResponse, HttpServer, Responder};
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use hcc_fleet::credentials::SecretCredentials;
use hcc_fleet::crd::MachineFleet;
use hcc_fleet::fleet_reconciler;
use hcc_fleet::metrics::Metrics;
use hcc_fleet::node_configurer::KubeNodes;
use hcc_fleet::store::KubeStore;
use hcc_fleet::Config;
use kube::api::ListParams;
use kube::runtime::{reflector, watcher, Controller, WatchStreamExt};
use kube::Client;
use prometheus_client::registry::Registry;
use std::fs::File;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[get("/metrics")]
async fn metrics_endpoint(registry: WebData<Registry>) -> impl Responder {
    let mut body = String::new();
    match prometheus_client::encoding::text::encode(&mut body, &registry) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health_endpoint() -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let client = Client::try_default().await?;

    let config: Config = if let Ok(config_filename) = std::env::var("CONFIG") {
        serde_yaml::from_reader(File::open(config_filename)?)?
    } else {
        Config::default()
    };

    let mut registry = Registry::with_prefix("machinefleet_reconcile");
    let reconcile_metrics = Metrics::default().register(&mut registry);
    let registry = WebData::new(registry);

    let mut futures = vec![];

    if config.fleet.enabled {
        let fleets = kube::Api::<MachineFleet>::all(client.clone());
        fleets
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| anyhow::anyhow!("is the MachineFleet CRD installed? (cargo run --bin crdgen | kubectl apply -f -): {e}"))?;

        let data = Arc::new(fleet_reconciler::Data {
            store: Arc::new(KubeStore::new(client.clone())),
            credentials: Arc::new(SecretCredentials { client: client.clone() }),
            connector: Arc::new(config.fleet.backend),
            nodes: Arc::new(KubeNodes::new(client.clone(), config.fleet.join_timeout())),
            config: config.fleet.clone(),
            metrics: reconcile_metrics,
        });

        let (reader, writer) = reflector::store();
        let fleet_events = reflector(writer, watcher(fleets, watcher::Config::default()))
            .default_backoff()
            .applied_objects();

        futures.push(
            async move {
                Controller::for_stream(fleet_reconciler::spec_changes(fleet_events), reader)
                    .shutdown_on_signal()
                    .run(fleet_reconciler::reconcile, fleet_reconciler::error_policy, data)
                    .for_each(|res| async move {
                        match res {
                            Ok(o) => info!("reconciled {}", o.0.name),
                            Err(e) => warn!("reconciliation error: {:?}", e),
                        }
                    })
                    .await;
            }
            .boxed_local(),
        );
    }

    if config.metrics.enabled {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(registry.clone())
                .service(metrics_endpoint)
                .service(health_endpoint)
        })
        .bind(&config.metrics.address)?
        .shutdown_timeout(5)
        .run();

        futures.push(
            async move {
                if let Err(e) = server.await {
                    warn!("metrics server exited: {}", e);
                }
            }
            .boxed_local(),
        );
    }

    join_all(futures).await;

    Ok(())
}
