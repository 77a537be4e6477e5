use {logkeeper::LogKeeper, std::io::Write};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut sink = LogKeeper::builder("./logs/worker.log")
        .max_bytes(64 * 1024)
        .max_backups(4)
        .build()?;

    for job in 1..=20 {
        writeln!(sink, "job {job:04} picked up")?;
        writeln!(sink, "job {job:04} finished in {}ms", job * 7)?;
    }

    // Cut over to a fresh file at a natural boundary, like the end of a
    // batch; the previous file becomes a timestamped backup.
    sink.rotate()?;
    writeln!(sink, "batch complete, starting the next one")?;

    Ok(())
}
