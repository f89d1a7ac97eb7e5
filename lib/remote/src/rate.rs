use std::collections::VecDeque;

use dashmap::DashMap;
use stackhaul_client::entities::stackhaul_timestamp;

use crate::ExecuteError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Sliding window admission control per host. Refuses with
/// `RateLimited` when either the per-minute or per-hour quota
/// is exhausted.
pub struct RateLimiter {
  per_minute: u32,
  per_hour: u32,
  windows: DashMap<String, VecDeque<i64>>,
}

impl RateLimiter {
  pub fn new(per_minute: u32, per_hour: u32) -> RateLimiter {
    RateLimiter {
      per_minute,
      per_hour,
      windows: Default::default(),
    }
  }

  pub fn admit(&self, host_key: &str) -> Result<(), ExecuteError> {
    self.admit_at(host_key, stackhaul_timestamp())
  }

  fn admit_at(
    &self,
    host_key: &str,
    now: i64,
  ) -> Result<(), ExecuteError> {
    let mut window =
      self.windows.entry(host_key.to_string()).or_default();
    while let Some(&front) = window.front() {
      if now - front >= HOUR_MS {
        window.pop_front();
      } else {
        break;
      }
    }
    if window.len() >= self.per_hour as usize {
      return Err(ExecuteError::RateLimited {
        host: host_key.to_string(),
      });
    }
    let in_last_minute = window
      .iter()
      .rev()
      .take_while(|&&ts| now - ts < MINUTE_MS)
      .count();
    if in_last_minute >= self.per_minute as usize {
      return Err(ExecuteError::RateLimited {
        host: host_key.to_string(),
      });
    }
    window.push_back(now);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn admits_until_minute_quota() {
    let limiter = RateLimiter::new(3, 100);
    let now = 1_000_000;
    for i in 0..3 {
      assert!(
        limiter.admit_at("nas", now + i).is_ok(),
        "request {i}"
      );
    }
    assert!(matches!(
      limiter.admit_at("nas", now + 3),
      Err(ExecuteError::RateLimited { .. })
    ));
    // A minute later the window has slid.
    assert!(limiter.admit_at("nas", now + MINUTE_MS + 10).is_ok());
  }

  #[test]
  fn hour_quota_applies_across_minutes() {
    let limiter = RateLimiter::new(10, 12);
    let mut now = 0;
    for _ in 0..12 {
      assert!(limiter.admit_at("nas", now).is_ok());
      // Spread out so the minute quota never trips.
      now += 2 * MINUTE_MS;
    }
    assert!(matches!(
      limiter.admit_at("nas", now),
      Err(ExecuteError::RateLimited { .. })
    ));
  }

  #[test]
  fn hosts_are_independent() {
    let limiter = RateLimiter::new(1, 10);
    assert!(limiter.admit_at("a", 0).is_ok());
    assert!(limiter.admit_at("b", 0).is_ok());
    assert!(limiter.admit_at("a", 1).is_err());
  }
}
