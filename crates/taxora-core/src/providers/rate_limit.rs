//! Client-side request budget for providers with published free-tier limits

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Snapshot of a budget, exposed through the provider listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub requests_last_minute: u32,
    pub requests_today: u32,
    pub minute_limit: u32,
    pub daily_limit: u32,
    pub minute_remaining: u32,
    pub daily_remaining: u32,
}

/// Why the budget refused a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetExceeded {
    /// Too many requests in the sliding minute; wait this long
    Minute { wait: Duration },
    /// The daily allowance is spent
    Daily { used: u32 },
}

struct BudgetState {
    recent: VecDeque<Instant>,
    day: NaiveDate,
    today: u32,
}

/// Sliding-minute plus calendar-day request counter
pub struct RequestBudget {
    per_minute: u32,
    per_day: u32,
    state: Mutex<BudgetState>,
}

impl std::fmt::Debug for RequestBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBudget")
            .field("per_minute", &self.per_minute)
            .field("per_day", &self.per_day)
            .finish()
    }
}

impl RequestBudget {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_day,
            state: Mutex::new(BudgetState {
                recent: VecDeque::new(),
                day: Local::now().date_naive(),
                today: 0,
            }),
        }
    }

    /// Reserve one request slot, or explain why none is free
    pub fn try_acquire(&self) -> Result<(), BudgetExceeded> {
        self.try_acquire_at(Instant::now(), Local::now().date_naive())
    }

    fn try_acquire_at(&self, now: Instant, today: NaiveDate) -> Result<(), BudgetExceeded> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll(&mut state, now, today);

        if state.today >= self.per_day {
            return Err(BudgetExceeded::Daily { used: state.today });
        }
        if state.recent.len() as u32 >= self.per_minute {
            let oldest = state.recent.front().copied().unwrap_or(now);
            let wait = WINDOW.saturating_sub(now.saturating_duration_since(oldest));
            return Err(BudgetExceeded::Minute { wait });
        }

        state.recent.push_back(now);
        state.today += 1;
        Ok(())
    }

    pub fn status(&self) -> RateLimitStatus {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll(&mut state, Instant::now(), Local::now().date_naive());
        let minute = state.recent.len() as u32;
        RateLimitStatus {
            requests_last_minute: minute,
            requests_today: state.today,
            minute_limit: self.per_minute,
            daily_limit: self.per_day,
            minute_remaining: self.per_minute.saturating_sub(minute),
            daily_remaining: self.per_day.saturating_sub(state.today),
        }
    }

    fn roll(state: &mut BudgetState, now: Instant, today: NaiveDate) {
        while let Some(front) = state.recent.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                state.recent.pop_front();
            } else {
                break;
            }
        }
        if state.day != today {
            state.day = today;
            state.today = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_minute_limit() {
        let budget = RequestBudget::new(2, 100);
        let start = Instant::now();
        assert!(budget.try_acquire_at(start, day(1)).is_ok());
        assert!(budget.try_acquire_at(start, day(1)).is_ok());

        let later = start + Duration::from_secs(10);
        match budget.try_acquire_at(later, day(1)) {
            Err(BudgetExceeded::Minute { wait }) => assert_eq!(wait, Duration::from_secs(50)),
            other => panic!("expected minute limit, got {:?}", other),
        }

        // The window slides
        let after_window = start + Duration::from_secs(61);
        assert!(budget.try_acquire_at(after_window, day(1)).is_ok());
    }

    #[test]
    fn test_daily_limit_resets_next_day() {
        let budget = RequestBudget::new(100, 2);
        let start = Instant::now();
        budget.try_acquire_at(start, day(1)).unwrap();
        budget.try_acquire_at(start, day(1)).unwrap();
        assert_eq!(
            budget.try_acquire_at(start, day(1)),
            Err(BudgetExceeded::Daily { used: 2 })
        );
        assert!(budget.try_acquire_at(start, day(2)).is_ok());
    }

    #[test]
    fn test_status_reports_remaining() {
        let budget = RequestBudget::new(50, 1500);
        budget.try_acquire().unwrap();
        let status = budget.status();
        assert_eq!(status.requests_last_minute, 1);
        assert_eq!(status.requests_today, 1);
        assert_eq!(status.minute_remaining, 49);
        assert_eq!(status.daily_remaining, 1499);
    }
}
