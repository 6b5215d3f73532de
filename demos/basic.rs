//! Basic usage examples for pipeweld
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use async_trait::async_trait;
use pipeweld::prelude::*;

/// Custom transform that tags every word with its length
struct Measure;

#[async_trait]
impl Transform for Measure {
    type Input = String;
    type Output = (String, usize);

    async fn apply(&self, word: String) -> Result<(String, usize)> {
        let len = word.len();
        Ok((word, len))
    }
}

/// Example 1: take from an infinite repeat
async fn take_repeat_example() -> Result<()> {
    println!("=== Take from Repeat ===");

    let scope = Scope::new();
    let letters = take(&scope, repeat(&scope, vec!["a", "b"]), 5);
    while let Some(letter) = letters.recv().await? {
        println!("Letter: {}", letter);
    }
    scope.wait().await?;

    println!();
    Ok(())
}

/// Example 2: a pipeline with a custom transform
async fn custom_transform_example() -> Result<()> {
    println!("=== Custom Transform ===");

    let scope = Scope::new();
    let words = Generator::from_values(
        ["pipeline", "scope", "stage", "stream"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );

    let measured = Pipeline::builder()
        .workers(1)
        .source(&scope, &words)
        .stage(Measure)
        .collect()
        .await?;

    for (word, len) in measured {
        println!("{:>10} has {} letters", word, len);
    }

    println!();
    Ok(())
}

/// Example 3: a rate-limited producer
async fn throttle_example() -> Result<()> {
    println!("=== Throttled Pipeline ===");

    let scope = Scope::new();
    let limiter = RateLimiter::new(&scope, Duration::from_millis(100), 3);
    let start = tokio::time::Instant::now();

    Pipeline::from_generator(&scope, &Generator::from_iter_fn(|| 1..=6))
        .throttle(limiter)
        .for_each(|n| async move {
            println!("{:>4}ms  item {}", start.elapsed().as_millis(), n);
            Ok(())
        })
        .await?;

    scope.cancel();
    println!();
    Ok(())
}

/// Example 4: an error in one stage stops the pipeline
async fn error_example() -> Result<()> {
    println!("=== Error Propagation ===");

    let scope = Scope::new();
    let result = Pipeline::from_generator(&scope, &Generator::from_iter_fn(|| 1..=100))
        .and_then(|n: u32| async move {
            if n == 42 {
                Err(Error::custom(format!("refusing to process {}", n)))
            } else {
                Ok(n)
            }
        })
        .collect()
        .await;

    match result {
        Ok(items) => println!("Unexpected success with {} items", items.len()),
        Err(err) => println!("Pipeline stopped: {}", err),
    }

    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("pipeweld {} basic examples\n", pipeweld::VERSION);

    take_repeat_example().await?;
    custom_transform_example().await?;
    throttle_example().await?;
    error_example().await?;

    println!("All examples completed!");
    Ok(())
}
