use std::fmt;

use crate::config::Balancing;

/// Routes items across a fixed set of actors.
///
/// Tracks how many calls each actor has outstanding. Under
/// [`Balancing::LeastOutstanding`] the next item goes to the actor with the
/// fewest outstanding calls, ties broken by lowest index. Under
/// [`Balancing::RoundRobin`] actors are used in turn. With a per-actor cap,
/// actors at the cap are skipped and [`assign`](Self::assign) returns
/// `None` when every actor is full.
pub struct ActorLoadBalancer {
    balancing: Balancing,
    cap: Option<usize>,
    in_flight: Vec<usize>,
    assigned: Vec<usize>,
    cursor: usize,
}

impl fmt::Debug for ActorLoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorLoadBalancer")
            .field("balancing", &self.balancing)
            .field("cap", &self.cap)
            .field("actors", &self.in_flight.len())
            .field("in_flight", &self.total_in_flight())
            .finish()
    }
}

impl ActorLoadBalancer {
    /// Balance across `actors` actors. A cap of zero is treated as one.
    pub fn new(actors: usize, balancing: Balancing, cap: Option<usize>) -> Self {
        Self {
            balancing,
            cap: cap.map(|cap| cap.max(1)),
            in_flight: vec![0; actors],
            assigned: vec![0; actors],
            cursor: 0,
        }
    }

    /// Pick an actor for the next item and count the call against it.
    pub fn assign(&mut self) -> Option<usize> {
        let actor = match self.balancing {
            Balancing::LeastOutstanding => self
                .in_flight
                .iter()
                .enumerate()
                .filter(|(_, load)| self.has_room(**load))
                .min_by_key(|(index, load)| (**load, *index))
                .map(|(index, _)| index),
            Balancing::RoundRobin => {
                let count = self.in_flight.len();
                (0..count)
                    .map(|step| (self.cursor + step) % count)
                    .find(|index| self.has_room(self.in_flight[*index]))
            }
        }?;

        self.in_flight[actor] += 1;
        self.assigned[actor] += 1;
        if self.balancing == Balancing::RoundRobin {
            self.cursor = (actor + 1) % self.in_flight.len();
        }
        Some(actor)
    }

    /// Record that a call on `actor` finished.
    pub fn complete(&mut self, actor: usize) {
        if let Some(load) = self.in_flight.get_mut(actor) {
            *load = load.saturating_sub(1);
        }
    }

    /// Outstanding calls on `actor`.
    pub fn in_flight(&self, actor: usize) -> usize {
        self.in_flight.get(actor).copied().unwrap_or_default()
    }

    /// Outstanding calls across all actors.
    pub fn total_in_flight(&self) -> usize {
        self.in_flight.iter().sum()
    }

    /// Items routed to each actor so far.
    pub fn assigned(&self) -> &[usize] {
        &self.assigned
    }

    fn has_room(&self, load: usize) -> bool {
        self.cap.is_none_or(|cap| load < cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_outstanding_prefers_idle_actor() {
        let mut balancer = ActorLoadBalancer::new(3, Balancing::LeastOutstanding, None);
        assert_eq!(balancer.assign(), Some(0));
        assert_eq!(balancer.assign(), Some(1));
        assert_eq!(balancer.assign(), Some(2));

        balancer.complete(1);
        assert_eq!(balancer.assign(), Some(1));
        assert_eq!(balancer.assign(), Some(0));
        assert_eq!(balancer.assigned(), &[2, 2, 1]);
    }

    #[test]
    fn test_uncapped_dispatch_spreads_evenly() {
        let mut balancer = ActorLoadBalancer::new(4, Balancing::LeastOutstanding, None);
        for _ in 0..40 {
            balancer.assign().unwrap();
        }
        assert_eq!(balancer.assigned(), &[10, 10, 10, 10]);
    }

    #[test]
    fn test_cap_blocks_full_actors() {
        let mut balancer = ActorLoadBalancer::new(2, Balancing::LeastOutstanding, Some(1));
        assert_eq!(balancer.assign(), Some(0));
        assert_eq!(balancer.assign(), Some(1));
        assert_eq!(balancer.assign(), None);

        balancer.complete(1);
        assert_eq!(balancer.assign(), Some(1));
        assert_eq!(balancer.total_in_flight(), 2);
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut balancer = ActorLoadBalancer::new(3, Balancing::RoundRobin, None);
        let picks: Vec<_> = (0..6).filter_map(|_| balancer.assign()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_skips_capped_actor() {
        let mut balancer = ActorLoadBalancer::new(3, Balancing::RoundRobin, Some(1));
        assert_eq!(balancer.assign(), Some(0));
        assert_eq!(balancer.assign(), Some(1));
        balancer.complete(0);
        assert_eq!(balancer.assign(), Some(2));
        assert_eq!(balancer.assign(), Some(0));
        assert_eq!(balancer.assign(), None);
    }

    #[test]
    fn test_complete_is_saturating() {
        let mut balancer = ActorLoadBalancer::new(1, Balancing::LeastOutstanding, None);
        balancer.complete(0);
        balancer.complete(5);
        assert_eq!(balancer.in_flight(0), 0);
    }
}
