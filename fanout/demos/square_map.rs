//! Worker pool example.
//!
//! Squares a range of numbers on an in-process cluster, drains the results
//! before shutdown, and reads them afterwards. Also shows what happens when
//! one item fails.

use fanout::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let session = ClusterSession::builder()
        .with_address("local://squares")
        .with_num_workers(4)
        .start()
        .await?;
    println!("Started session {}", session.id());

    let squares = WorkerPoolMap::new(&session)
        .with_chunk_size(10)
        .map(|x: u64| Ok(x * x), 0..100u64)
        .await?;
    println!("Mapped {} items", squares.len());

    let outcome = WorkerPoolMap::new(&session)
        .with_options(MapOptions::default().with_name("reciprocal"))
        .map(
            |x: i64| {
                if x == 0 {
                    anyhow::bail!("cannot divide by zero");
                }
                Ok(1.0 / x as f64)
            },
            -3..3i64,
        )
        .await;
    match outcome {
        Ok(_) => println!("Unexpected success"),
        Err(err) => println!("Map failed as expected: {err}"),
    }

    let report = before_shutdown(&session).await?;
    println!(
        "Materialized {} result set(s) and {} handle(s)",
        report.result_sets, report.handles
    );
    session.shutdown().await?;

    let values = squares.to_vec()?;
    println!("First squares after shutdown: {:?}", &values[..10]);
    println!("Sum of squares: {}", values.iter().sum::<u64>());

    Ok(())
}
