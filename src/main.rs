use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use meter_ledger::domain::meter::{MeterEvent, ReadingRecorded, TokenPurchased};
use meter_ledger::{metrics, Backend, Config, Ledger, MemoryBackend, Metrics, PostgresBackend, RecordRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meter_ledger=debug"))
        )
        .init();

    tracing::info!("🚀 Starting meter ledger demo");

    let config = Config::from_env()?;

    // === 1. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // actix-web needs its own system; keep it off the main runtime
    let registry = metrics.registry().clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(registry, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 2. Backend ===
    let backend: Arc<dyn Backend> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to Postgres...");
            let postgres = PostgresBackend::connect(url, config.request_timeout)
                .await?
                .with_metrics(metrics.clone());
            postgres.ensure_schema().await?;
            Arc::new(postgres)
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory backend");
            Arc::new(MemoryBackend::new())
        }
    };

    // === 3. Write path + background reconciler ===
    let ledger = Ledger::new(backend, &config, metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = ledger.reconciler.clone();
    let reconciler_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    // === 4. Record a reading, then a token purchase ===
    let meter = "M123";
    tracing::info!("📝 Recording events for meter {}", meter);

    let reading = MeterEvent::ReadingRecorded(ReadingRecorded { value: 102.5, unit: "kWh".to_string() });
    let outcome = ledger.coordinator.record(RecordRequest::from_event(meter, &reading)).await?;
    tracing::info!(
        sequence = outcome.sequence,
        latest_reading = ?outcome.row.latest_reading,
        "✅ Reading recorded"
    );

    let purchase = MeterEvent::TokenPurchased(TokenPurchased { amount: 50.0, token: None });
    let key = Uuid::new_v4();
    let request = RecordRequest::from_event(meter, &purchase).with_idempotency_key(key);
    let outcome = ledger.coordinator.record(request.clone()).await?;
    tracing::info!(
        sequence = outcome.sequence,
        balance = outcome.row.balance,
        "✅ Token purchase recorded"
    );

    // A client retrying after a lost response reuses the key
    let retry = ledger.coordinator.submit(request).await?;
    tracing::info!(
        sequence = retry.sequence,
        replayed = retry.replayed,
        "🔁 Retry returned the original write"
    );

    let rebuilt = ledger.projector.rebuild(meter).await?;
    let current = ledger.projector.current(meter).await?;
    tracing::info!(
        latest_reading = ?current.latest_reading,
        balance = current.balance,
        last_applied_sequence = current.last_applied_sequence,
        matches_replay = (rebuilt == current),
        "📖 Read model"
    );

    // === 5. Shutdown ===
    let stats = ledger.reconciler.run_once().await?;
    tracing::info!(lagging = stats.lagging, "Final reconciliation pass");

    shutdown_tx.send(true)?;
    reconciler_task.await?;

    tracing::info!("🎉 Demo complete!");

    Ok(())
}
