//! Request-scoped pipelines torn down on client disconnect
//!
//! Each simulated request derives its own scope from the server scope and
//! cancels it when the client goes away. Run with:
//! cargo run --example request_scope

use std::time::Duration;

use pipeweld::prelude::*;
use tokio::sync::oneshot;
use tokio::time::sleep;

/// Stand-in for an HTTP handler: streams search hits until done or the
/// client disconnects.
async fn handle_request(server: &Scope, id: u32, disconnected: oneshot::Receiver<()>) -> Result<usize> {
    let request = server.child_with_timeout(Duration::from_millis(400));
    request.cancel_on(disconnected);

    let backends = vec![
        Generator::repeat_with(move || format!("req{id}: hit from index A")),
        Generator::repeat_with(move || format!("req{id}: hit from index B")),
    ];
    let hits = merge(&request, backends.iter().map(|g| g.spawn(&request)).collect());
    let limiter = RateLimiter::new(&request, Duration::from_millis(50), 2);

    let streamed = PipelineBuilder::new()
        .workers(1)
        .generate(&request, |tx| async move {
            while let Some(hit) = hits.recv().await? {
                tx.send(hit).await?;
            }
            Ok(())
        })
        .throttle(limiter)
        .take(6)
        .reduce(0, |count, hit: String| {
            println!("  {}", hit);
            count + 1
        })
        .await;

    // Stops the backends and the limiter ticker once the response is done.
    request.cancel();
    streamed
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("Request Scope Example\n");
    let server = Scope::new();

    println!("=== Request 1: client stays ===");
    let (_keep, rx) = oneshot::channel();
    let count = handle_request(&server, 1, rx).await?;
    println!("request 1 streamed {} hits\n", count);

    println!("=== Request 2: client leaves early ===");
    let (leave, rx) = oneshot::channel();
    tokio::spawn(async move {
        sleep(Duration::from_millis(120)).await;
        drop(leave);
    });
    match handle_request(&server, 2, rx).await {
        Ok(count) => println!("request 2 streamed {} hits", count),
        Err(err) if err.is_cancellation() => println!("request 2 torn down: {}", err),
        Err(err) => return Err(err),
    }

    println!("\nserver scope still running: {}", !server.is_cancelled());
    Ok(())
}
