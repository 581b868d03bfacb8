use async_trait::async_trait;
use axum::{serve, Router};
use rmq::{stats_ui, Cleaner, Connection, ConnectionConfig, Consumer, Delivery, RedisStore};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

/// Acks every second delivery and rejects the rest
struct FlakyConsumer;

#[async_trait]
impl Consumer for FlakyConsumer {
    async fn consume(&self, mut delivery: Delivery) {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let counter: u64 = delivery.payload().parse().unwrap_or_default();
        let result = if counter % 2 == 0 {
            delivery.ack().await
        } else {
            delivery.reject().await
        };
        match result {
            Ok(true) => println!("✓ {} {}", delivery.payload(), delivery.state()),
            Ok(false) => println!("… {} was recovered elsewhere", delivery.payload()),
            Err(e) => eprintln!("✗ {}: {}", delivery.payload(), e),
        }
    }
}

/// Serves the stats page at http://localhost:8081/rmq while a producer, a
/// consumer and a cleaner run against the same Redis.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = Arc::new(RedisStore::builder().redis_url(&redis_url).build().await?);

    let connection = Arc::new(Connection::open("demo", store, ConnectionConfig::default()).await?);
    let queue = connection.open_queue("demo-jobs").await?;
    queue.start_consuming(5, Duration::from_millis(100)).await?;
    queue.add_consumer("flaky", FlakyConsumer).await?;

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut counter = 0u64;
            loop {
                if let Err(e) = queue.publish(counter.to_string()).await {
                    eprintln!("✗ Failed to publish: {}", e);
                }
                counter += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleaner = {
        let cleaner = Cleaner::new(connection.clone());
        tokio::spawn(async move { cleaner.run(Duration::from_secs(10), shutdown_rx).await })
    };

    let app = Router::new()
        .nest("/rmq", stats_ui(connection.clone(), Vec::new()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8081").await?;
    println!("✨ rmq stats: http://{}/rmq", listener.local_addr()?);
    println!("   JSON at /rmq/stats, text at /rmq/stats.txt");
    println!("   Press Ctrl+C to stop");

    serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    producer.abort();
    let _ = shutdown_tx.send(true);
    let _ = cleaner.await;
    connection.shutdown().await?;
    Ok(())
}
