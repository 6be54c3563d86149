//! Map operations over a cluster session.
//!
//! [`WorkerPoolMap`] runs a plain function on stateless tasks.
//! [`ActorPoolMap`] runs a method on a pool of actors that keep state
//! built once at spawn time, which pays off when that state is expensive
//! to build (a loaded model, an open index). Both return
//! [`MapResults`](crate::results::MapResults) in input order and fail the
//! whole call on the first failing item.

mod actor;
mod balance;
mod worker;

pub use actor::ActorPoolMap;
pub use balance::ActorLoadBalancer;
pub use worker::WorkerPoolMap;
