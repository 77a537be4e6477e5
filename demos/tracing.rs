use {logkeeper::LogKeeper, tracing_subscriber::util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sink = LogKeeper::builder("./logs/service.log")
        .max_bytes(5 * 1024 * 1024)
        .max_backups(7)
        .max_age_days(14) // Two weeks of history at most
        .compress(true)
        .build()?;
    let (writer, _guard) = tracing_appender::non_blocking(sink);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .compact()
        .finish()
        .try_init()?;

    for attempt in 1u32..=3 {
        tracing::info!(attempt, endpoint = "api.example.com/v1/sync", "sync started");
        if attempt < 3 {
            tracing::warn!(attempt, backoff_ms = attempt * 250, "rate limited, backing off");
        } else {
            tracing::info!(attempt, records = 1248, "sync finished");
        }
    }

    Ok(())
}
