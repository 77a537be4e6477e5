use {logkeeper::LogKeeper, std::io::Write};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut sink = LogKeeper::builder("./logs/compressed.log")
        .max_bytes(1024 * 1024) // Rotate at 1 MiB
        .max_backups(2) // Keep only the two newest backups
        .max_age_days(7) // And nothing older than a week
        .compress(true) // Gzip backups in the background
        .build()?;

    // Enough volume to trigger a few rotations and background compressions.
    for seq in 1..=40_000u32 {
        writeln!(
            sink,
            "seq={seq} level=debug worker={} queue_depth={} msg=\"heartbeat ok\"",
            seq % 8,
            (seq * 13) % 97,
        )?;
    }

    // Let the worker finish compressing before the process exits.
    sink.flush_background();

    Ok(())
}
