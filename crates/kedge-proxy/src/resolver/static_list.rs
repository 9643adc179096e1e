use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Resolver, Target, dedup_targets};
use crate::error::ResolveResult;

/// Fixed address list. The ttl only controls how often the pool wakes up.
pub struct StaticResolver {
    addresses: Vec<String>,
    ttl: Duration,
}

impl StaticResolver {
    pub fn new(addresses: Vec<String>, ttl: Duration) -> Self {
        Self { addresses, ttl }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self) -> ResolveResult<Vec<Target>> {
        let deadline = Instant::now() + self.ttl;
        Ok(dedup_targets(
            self.addresses
                .iter()
                .map(|a| Target::new(a.clone(), deadline))
                .collect(),
        ))
    }
}
