use std::sync::Arc;

use tracing::info;

use tandem::calendar::{CalendarSource, JsonDirCalendarSource, NoCalendars};
use tandem::config::ServiceConfig;
use tandem::engine::{Engine, SchedulingPolicy, SlotSearch};
use tandem::notify::{LogSender, NotifyHub, run_dispatcher};
use tandem::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env()?;
    tandem::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let policy = SchedulingPolicy {
        search: SlotSearch {
            hours: config.business_hours.clone(),
            ..SlotSearch::default()
        },
        ..SchedulingPolicy::default()
    };
    policy.validate()?;

    let calendars: Arc<dyn CalendarSource> = match &config.calendar_dir {
        Some(dir) => Arc::new(JsonDirCalendarSource::new(dir)),
        None => Arc::new(NoCalendars),
    };

    let notify = Arc::new(NotifyHub::new());
    let dispatcher = tokio::spawn(run_dispatcher(notify.subscribe_all(), Arc::new(LogSender)));

    let engine = Arc::new(Engine::new(
        config.data_dir.join("tandem.wal"),
        notify,
        calendars,
        policy,
    )?);

    let sweeper_task = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    let compactor_task = tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    info!("tandem worker started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  bookings: {}", engine.state.len());
    info!("  sweep every: {:?}", config.sweep_interval);
    info!("  timezone: {}", config.business_hours.timezone);
    info!(
        "  calendars: {}",
        config
            .calendar_dir
            .as_ref()
            .map_or("none (all free)".to_string(), |d| d.display().to_string())
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    info!("shutdown signal received");

    sweeper_task.abort();
    compactor_task.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction skipped: {e}");
    }
    drop(engine);
    dispatcher.abort();

    info!("tandem stopped");
    Ok(())
}
