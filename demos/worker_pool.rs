//! Producer, worker pool and reducer wired by hand
//!
//! Run with: cargo run --example worker_pool

use std::time::Duration;

use pipeweld::prelude::*;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct Job {
    id: u32,
    cost_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("Worker Pool Example\n");

    let scope = Scope::with_timeout(Duration::from_secs(5));

    // Producer: a one-shot generator owning its sender
    let jobs = generate(&scope, 4, |tx| async move {
        for id in 0..20 {
            tx.send(Job {
                id,
                cost_ms: 10 + u64::from(id % 4) * 15,
            })
            .await?;
        }
        tx.close();
        Ok(())
    });

    // Workers: the last one to exit closes `results`
    let results = Stage::new(
        4,
        transform_fn(|job: Job| async move {
            sleep(Duration::from_millis(job.cost_ms)).await;
            Ok((job.id, job.cost_ms))
        }),
    )
    .name("jobs")
    .capacity(4)
    .spawn(&scope, jobs);

    // Reducer: drain until the pool closes the stream
    let start = Instant::now();
    let mut total_cost = 0;
    while let Some((id, cost)) = results.recv().await? {
        println!("job {:>2} finished after {:>3}ms", id, start.elapsed().as_millis());
        total_cost += cost;
    }
    scope.wait().await?;

    println!(
        "\n{}ms of work done in {}ms by 4 workers",
        total_cost,
        start.elapsed().as_millis()
    );
    Ok(())
}
