use futures::stream;
use microservice_mesh::config::{NodeConfig, USAGE};
use microservice_mesh::membership::service::gossip_cluster;
use microservice_mesh::microservice::{Microservice, MicroserviceOptions};
use microservice_mesh::registry::types::Service;
use microservice_mesh::transport::http::http_transport;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn greet_service() -> Service {
    Service::builder("greet")
        .request_response("hello", |data: Value| async move {
            let name = data
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("missing 'name'"))?;
            anyhow::Ok(json!({ "greeting": format!("Hello {}", name) }))
        })
        .request_stream("countdown", |data: Value| {
            let from = data.get("from").and_then(Value::as_u64).unwrap_or(3);
            stream::iter((0..=from).rev().map(|n| anyhow::Ok(json!(n))))
        })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match NodeConfig::from_args(args.iter().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Usage: {} {}", args[0], USAGE);
            eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
            eprintln!(
                "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
                args[0]
            );
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Node (gossip membership + HTTP transport):
    let mut options = MicroserviceOptions::new()
        .address(&config.bind)
        .service(greet_service())
        .cluster(gossip_cluster())
        .transport(http_transport());
    for seed in &config.seeds {
        options = options.seed_address(seed);
    }

    let microservice = Arc::new(Microservice::create(options).await?);

    // 2. Spawn stats reporter:
    let stats_node = microservice.clone();
    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let Ok(members) = stats_node.members() else {
                break;
            };
            tracing::info!("Cluster stats: {} remote member(s)", members.len());
            for member in members {
                let qualifiers: Vec<&str> = member
                    .endpoints
                    .iter()
                    .map(|endpoint| endpoint.qualifier.as_str())
                    .collect();
                tracing::info!("  - {} serves {:?}", member.address, qualifiers);
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    // 3. Shutdown:
    tracing::info!("Shutting down...");
    stats.abort();
    microservice.destroy().await?;

    Ok(())
}
