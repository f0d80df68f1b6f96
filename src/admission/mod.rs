// ABOUTME: Admission control for generation jobs and work units.
// ABOUTME: Contains the concurrency gateway and the sliding-window rate limiter.

mod manager;
mod rate_limiter;

pub use manager::{AdmissionStats, ConcurrencyManager, TaskStatus};
pub use rate_limiter::{Cancelled, RateLimiter, RateUsage};

#[cfg(test)]
mod rate_limiter_test;
