//! Resident-byte accounting against a soft memory budget
//!
//! Tracks how many bytes of resources are resident and how that compares to
//! the configured budget. The budget is soft: usage may exceed it while
//! every resident entry is pinned, and the overage is reported rather than
//! refused.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-100% utilization)
    High,
    /// Memory usage is over budget
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization <= 1.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Resident-byte counter with a fixed budget
///
/// # Example
///
/// ```
/// use outcore_cache::{MemoryBudget, MemoryPressure};
///
/// let budget = MemoryBudget::new(1000);
/// budget.record_allocation(900);
/// assert_eq!(budget.pressure(), MemoryPressure::High);
///
/// budget.record_allocation(200);
/// assert!(budget.is_over_budget());
/// assert_eq!(budget.overage(), 100);
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    /// Current resident bytes
    current_usage: AtomicU64,
}

impl MemoryBudget {
    /// Create a budget of `limit` bytes with nothing resident
    pub fn new(limit: u64) -> Self {
        Self { limit, current_usage: AtomicU64::new(0) }
    }

    /// Get the budget in bytes
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the current resident bytes
    pub fn current_usage(&self) -> u64 {
        self.current_usage.load(Ordering::Acquire)
    }

    /// Get the bytes still available before the budget is reached
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.current_usage())
    }

    /// Get the current utilization ratio (may exceed 1.0)
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            if self.current_usage() == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            self.current_usage() as f64 / self.limit as f64
        }
    }

    /// Get the current memory pressure level
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Whether resident bytes exceed the budget
    pub fn is_over_budget(&self) -> bool {
        self.current_usage() > self.limit
    }

    /// Bytes above the budget (0 when within budget)
    pub fn overage(&self) -> u64 {
        self.current_usage().saturating_sub(self.limit)
    }

    /// Record bytes becoming resident, returning the new total
    pub fn record_allocation(&self, bytes: u64) -> u64 {
        self.current_usage.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Record bytes leaving memory, returning the new total
    pub fn record_deallocation(&self, bytes: u64) -> u64 {
        let previous = self
            .current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_sub(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.3), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.6), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(1.0), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(1.2), MemoryPressure::Critical);
    }

    #[test]
    fn test_memory_budget_basic() {
        let budget = MemoryBudget::new(100);

        assert_eq!(budget.limit(), 100);
        assert_eq!(budget.current_usage(), 0);
        assert_eq!(budget.available(), 100);
        assert_eq!(budget.utilization(), 0.0);
        assert_eq!(budget.pressure(), MemoryPressure::Low);
        assert!(!budget.is_over_budget());
    }

    #[test]
    fn test_memory_budget_allocation() {
        let budget = MemoryBudget::new(100);

        assert_eq!(budget.record_allocation(50), 50);
        assert_eq!(budget.available(), 50);
        assert_eq!(budget.pressure(), MemoryPressure::Moderate);

        assert_eq!(budget.record_deallocation(20), 30);
        assert_eq!(budget.current_usage(), 30);
    }

    #[test]
    fn test_deallocation_saturates() {
        let budget = MemoryBudget::new(100);
        budget.record_allocation(10);

        assert_eq!(budget.record_deallocation(25), 0);
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn test_overage_is_reported_not_refused() {
        let budget = MemoryBudget::new(128);
        budget.record_allocation(200);

        assert!(budget.is_over_budget());
        assert_eq!(budget.overage(), 72);
        assert_eq!(budget.available(), 0);
        assert_eq!(budget.pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_zero_budget() {
        let budget = MemoryBudget::new(0);
        assert_eq!(budget.pressure(), MemoryPressure::Low);

        budget.record_allocation(1);
        assert!(budget.is_over_budget());
        assert_eq!(budget.pressure(), MemoryPressure::Critical);
    }
}
