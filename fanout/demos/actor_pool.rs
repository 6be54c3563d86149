//! Actor pool example.
//!
//! Builds an expensive lookup table once per actor, then routes items to
//! the least busy actor. Uses the shutdown coordinator to drain and stop
//! the session in one step.

use std::collections::HashMap;
use std::time::Duration;

use fanout::*;

/// State built once per actor.
struct Dictionary {
    words: HashMap<u32, String>,
}

impl Dictionary {
    fn load(size: u32) -> anyhow::Result<Self> {
        std::thread::sleep(Duration::from_millis(50));
        let words = (0..size).map(|n| (n, format!("word-{n:04}"))).collect();
        Ok(Self { words })
    }

    fn lookup(&mut self, key: u32, suffix: &String) -> anyhow::Result<String> {
        if key % 7 == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        match self.words.get(&key) {
            Some(word) => Ok(format!("{word}{suffix}")),
            None => anyhow::bail!("no word for key {key}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let session = ClusterSession::start(ClusterConfig::local()).await?;

    let options = ActorPoolOptions::new(4)
        .with_name("dictionary")
        .with_balancing(Balancing::LeastOutstanding);
    let words = ActorPoolMap::new(&session)
        .with_options(options)
        .map_with(Dictionary::load, 1_000, Dictionary::lookup, 0..40u32, "!".to_string())
        .await?;
    println!("Looked up {} keys", words.len());

    let report = ShutdownCoordinator::new(&session).shutdown().await?;
    println!(
        "Session {} drained {} result set(s) at {}",
        report.session, report.result_sets, report.completed_at
    );

    for (key, word) in words.to_vec()?.iter().enumerate().take(5) {
        println!("  {key} -> {word}");
    }

    Ok(())
}
