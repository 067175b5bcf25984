//! Request pacing: a minimum spacing between calls to the same service
//! and a fixed pause after every page.

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::config::PipelineConfig;
use crate::core::error::Service;

type DirectRateLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Waits until a call to `service` may be issued.
    async fn before_call(&self, service: Service);

    /// Pause after page `index`. Returns `false` if cancelled while waiting.
    async fn after_page(&self, index: usize, cancel: &CancellationToken) -> bool;
}

pub struct PacingLimiter {
    spacing: HashMap<Service, Arc<DirectRateLimiter>>,
    page_delay: Duration,
}

impl PacingLimiter {
    pub fn new(min_call_spacing: Duration, page_delay: Duration) -> Self {
        let spacing = match Quota::with_period(min_call_spacing) {
            Some(quota) => [Service::Text, Service::Image, Service::Speech]
                .into_iter()
                .map(|s| (s, Arc::new(GovernorRateLimiter::direct(quota))))
                .collect(),
            // A zero period means no spacing.
            None => HashMap::new(),
        };
        Self {
            spacing,
            page_delay,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.min_call_spacing_ms),
            Duration::try_from_secs_f64(cfg.page_delay_secs).unwrap_or(Duration::ZERO),
        )
    }

    pub fn page_delay(&self) -> Duration {
        self.page_delay
    }
}

#[async_trait]
impl RateLimiter for PacingLimiter {
    async fn before_call(&self, service: Service) {
        if let Some(limiter) = self.spacing.get(&service) {
            limiter.until_ready().await;
        }
    }

    async fn after_page(&self, index: usize, cancel: &CancellationToken) -> bool {
        if self.page_delay.is_zero() {
            return !cancel.is_cancelled();
        }
        debug!("Pausing {:?} after page {}", self.page_delay, index);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.page_delay) => true,
        }
    }
}
