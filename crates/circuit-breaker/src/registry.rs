use std::sync::Arc;

use dashmap::DashMap;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

/// Named breakers, created on first use with a shared config
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn any_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|entry| entry.value().state() == CircuitState::Open)
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        tracing::info!("Reset {} circuit breakers", self.breakers.len());
    }

    /// Snapshots sorted by name
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
