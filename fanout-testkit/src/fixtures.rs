//! Task functions and actors shared by tests and benches.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Sleep for a random duration of up to `max_ms` milliseconds.
pub fn jitter(max_ms: u64) {
    if max_ms == 0 {
        return;
    }
    thread::sleep(Duration::from_millis(rand::random_range(0..=max_ms)));
}

pub fn square(x: u64) -> anyhow::Result<u64> {
    Ok(x * x)
}

/// `square` after a random delay, so tasks finish out of order.
pub fn jittered_square(max_ms: u64) -> impl Fn(u64) -> anyhow::Result<u64> + Send + Sync + 'static {
    move |x| {
        jitter(max_ms);
        square(x)
    }
}

/// Identity that fails on `bad`.
pub fn fail_at(bad: usize) -> impl Fn(usize) -> anyhow::Result<usize> + Send + Sync + 'static {
    move |x| {
        if x == bad {
            bail!("item {x} rejected");
        }
        Ok(x)
    }
}

/// Per-item cost that is much higher for every fifth item.
pub fn uneven_cost(item: u64) -> Duration {
    if item % 5 == 0 {
        Duration::from_millis(20)
    } else {
        Duration::from_millis(2)
    }
}

/// Per-item cost where item 0 is slow and every other item is cheap.
#[derive(Clone, Copy, Debug)]
pub struct HeadHeavy {
    pub head_ms: u64,
    pub rest_ms: u64,
}

impl HeadHeavy {
    pub fn cost(&self, item: u64) -> Duration {
        Duration::from_millis(if item == 0 { self.head_ms } else { self.rest_ms })
    }
}

/// Output of a [`Tally`] call: which actor handled the item, and the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handled {
    pub actor: usize,
    pub value: u64,
}

/// Stateful actor that squares items and counts how many it handled.
#[derive(Debug)]
pub struct Tally {
    pub id: usize,
    pub handled: usize,
}

impl Tally {
    /// Constructor for an actor pool. Every actor built from the same
    /// `ids` gets the next id.
    pub fn spawn(ids: Arc<AtomicUsize>) -> anyhow::Result<Self> {
        Ok(Self {
            id: ids.fetch_add(1, Ordering::SeqCst),
            handled: 0,
        })
    }

    /// Square `item` after sleeping for its [`uneven_cost`].
    pub fn handle(&mut self, item: u64) -> anyhow::Result<Handled> {
        thread::sleep(uneven_cost(item));
        self.handled += 1;
        Ok(Handled {
            actor: self.id,
            value: item * item,
        })
    }

    /// Square `item` after sleeping for its [`HeadHeavy`] cost.
    pub fn handle_costed(&mut self, item: u64, cost: &HeadHeavy) -> anyhow::Result<Handled> {
        thread::sleep(cost.cost(item));
        self.handled += 1;
        Ok(Handled {
            actor: self.id,
            value: item * item,
        })
    }

    /// Square `item` after a random delay of up to `max_ms`.
    pub fn handle_jittered(&mut self, item: u64, max_ms: &u64) -> anyhow::Result<Handled> {
        jitter(*max_ms);
        self.handled += 1;
        Ok(Handled {
            actor: self.id,
            value: item * item,
        })
    }
}

/// Count how many items each actor id handled.
pub fn per_actor(results: &[Handled], pool_size: usize) -> Vec<usize> {
    let mut counts = vec![0; pool_size];
    for handled in results {
        if let Some(count) = counts.get_mut(handled.actor) {
            *count += 1;
        }
    }
    counts
}
