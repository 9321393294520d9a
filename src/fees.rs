//! Dynamic base-fee pricing for cross-chain calls.
//!
//! Target-utilization controller in the style of EIP-1559, applied per fixed
//! time window instead of per block. Gas consumed by priced operations is
//! accumulated for the current window; when the window expires the base fee is
//! pulled up or down depending on how far usage landed from the target.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

const SCALE: u128 = 1_000_000_000_000_000_000;

pub const DEFAULT_GAS_TARGET_PER_WINDOW: u64 = 5_000_000;
pub const DEFAULT_ADJUSTMENT_DENOMINATOR: u64 = 2;
pub const DEFAULT_WINDOW_DURATION_SECONDS: u64 = 1;
pub const DEFAULT_INITIAL_BASE_FEE: u64 = 1;
pub const DEFAULT_MIN_BASE_FEE: u64 = 1;

/// Fee controller state, as stored by the destination program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeWindowState {
    /// Gas target per window
    pub target: u64,
    /// Adjustment denominator (controls rate of change)
    pub denominator: u64,
    pub window_duration_seconds: u64,
    pub current_base_fee: u64,
    /// Gas used in the current window
    pub current_window_gas_used: u64,
    /// Unix timestamp when the current window started
    pub window_start_time: i64,
}

impl FeeWindowState {
    pub fn new(now: i64) -> Self {
        Self {
            target: DEFAULT_GAS_TARGET_PER_WINDOW,
            denominator: DEFAULT_ADJUSTMENT_DENOMINATOR,
            window_duration_seconds: DEFAULT_WINDOW_DURATION_SECONDS,
            current_base_fee: DEFAULT_INITIAL_BASE_FEE,
            current_window_gas_used: 0,
            window_start_time: now,
        }
    }

    /// Number of whole windows elapsed since `window_start_time`
    pub fn expired_windows(&self, now: i64) -> u64 {
        if now <= self.window_start_time || self.window_duration_seconds == 0 {
            return 0;
        }
        (now - self.window_start_time) as u64 / self.window_duration_seconds
    }

    /// Roll every expired window. Returns the base fee in force at `now`.
    pub fn roll(&mut self, now: i64, min_base_fee: u64) -> u64 {
        let expired = self.expired_windows(now);
        if expired == 0 {
            return self.current_base_fee;
        }

        let mut base_fee = self.next_base_fee(self.current_window_gas_used, min_base_fee);

        // Remaining windows saw no usage:
        //   fee_{n+1} = fee_n * (denom - 1) / denom  =>  fee_n = fee_0 * ((denom - 1) / denom)^n
        let empty_windows = expired - 1;
        if empty_windows > 0 && self.denominator > 0 {
            let ratio = (self.denominator as u128 * SCALE - SCALE) / self.denominator as u128;
            let factor = fixed_pow(ratio, empty_windows);
            base_fee = ((base_fee as u128 * factor) / SCALE) as u64;
            base_fee = base_fee.max(min_base_fee);
        }

        debug!(
            expired_windows = expired,
            gas_used = self.current_window_gas_used,
            old_base_fee = self.current_base_fee,
            new_base_fee = base_fee,
            "Fee window rolled"
        );

        self.current_base_fee = base_fee;
        self.current_window_gas_used = 0;
        self.window_start_time += (expired * self.window_duration_seconds) as i64;
        base_fee
    }

    /// Base fee for the next window given this window's gas usage
    fn next_base_fee(&self, gas_used: u64, min_base_fee: u64) -> u64 {
        if self.target == 0 || self.denominator == 0 || gas_used == self.target {
            return self.current_base_fee.max(min_base_fee);
        }

        let base = self.current_base_fee as u128;
        let divisor = self.target as u128 * self.denominator as u128;
        let next = if gas_used > self.target {
            let delta = (gas_used - self.target) as u128;
            let increase = (base * delta / divisor).max(1);
            (base + increase).min(u64::MAX as u128) as u64
        } else {
            let delta = (self.target - gas_used) as u128;
            let decrease = base * delta / divisor;
            base.saturating_sub(decrease) as u64
        };
        next.max(min_base_fee)
    }
}

/// Pricing parameters that are not part of the rolling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeParams {
    /// Floor under the base fee
    pub min_base_fee: u64,
    pub gas_cost_scaler: u64,
    pub gas_cost_scaler_dp: u64,
}

impl Default for FeeParams {
    fn default() -> Self {
        Self {
            min_base_fee: DEFAULT_MIN_BASE_FEE,
            gas_cost_scaler: 1_000_000,
            gas_cost_scaler_dp: 1_000_000,
        }
    }
}

/// A priced operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub gas: u64,
    pub base_fee: u64,
    /// Fee in the settlement asset's smallest unit
    pub fee: u64,
}

/// Shared fee controller. Rolling the window and accounting gas happen under a
/// single lock so operations racing across a window boundary roll it once.
#[derive(Debug)]
pub struct FeeModel {
    state: Mutex<FeeWindowState>,
    params: FeeParams,
}

impl FeeModel {
    pub fn new(state: FeeWindowState, params: FeeParams) -> Self {
        Self {
            state: Mutex::new(state),
            params,
        }
    }

    /// Price `gas` at `now` and account it to the current window.
    pub fn charge(&self, gas: u64, now: i64) -> Quote {
        let mut state = self.lock();
        let base_fee = state.roll(now, self.params.min_base_fee);
        state.current_window_gas_used = state.current_window_gas_used.saturating_add(gas);
        Quote {
            gas,
            base_fee,
            fee: self.scaled_fee(gas, base_fee),
        }
    }

    /// Price `gas` at `now` without recording usage.
    pub fn quote(&self, gas: u64, now: i64) -> Quote {
        let mut state = *self.lock();
        let base_fee = state.roll(now, self.params.min_base_fee);
        Quote {
            gas,
            base_fee,
            fee: self.scaled_fee(gas, base_fee),
        }
    }

    pub fn snapshot(&self) -> FeeWindowState {
        *self.lock()
    }

    fn scaled_fee(&self, gas: u64, base_fee: u64) -> u64 {
        if self.params.gas_cost_scaler_dp == 0 {
            return 0;
        }
        let raw = gas as u128 * base_fee as u128 * self.params.gas_cost_scaler as u128
            / self.params.gas_cost_scaler_dp as u128;
        raw.min(u64::MAX as u128) as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeeWindowState> {
        // A poisoned lock still holds a consistent state: every mutation is
        // a plain field assignment.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `base^exp` in `SCALE` fixed point, for `base <= SCALE`.
fn fixed_pow(mut base: u128, mut exp: u64) -> u128 {
    let mut acc = SCALE;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * base / SCALE;
        }
        base = base * base / SCALE;
        exp >>= 1;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state_with_fee(fee: u64, start: i64) -> FeeWindowState {
        FeeWindowState {
            current_base_fee: fee,
            ..FeeWindowState::new(start)
        }
    }

    #[test]
    fn test_new_state_creation() {
        let state = FeeWindowState::new(1234567890);
        assert_eq!(state.target, DEFAULT_GAS_TARGET_PER_WINDOW);
        assert_eq!(state.denominator, DEFAULT_ADJUSTMENT_DENOMINATOR);
        assert_eq!(state.current_base_fee, DEFAULT_INITIAL_BASE_FEE);
        assert_eq!(state.current_window_gas_used, 0);
        assert_eq!(state.window_start_time, 1234567890);
    }

    #[test]
    fn test_base_fee_unchanged_at_target() {
        let state = state_with_fee(1000, 0);
        assert_eq!(state.next_base_fee(state.target, 1), 1000);
    }

    #[test]
    fn test_base_fee_rises_above_target() {
        let state = state_with_fee(1000, 0);
        // (3_000_000 * 1000) / 5_000_000 / 2 = 300
        assert_eq!(state.next_base_fee(8_000_000, 1), 1300);
    }

    #[test]
    fn test_base_fee_falls_below_target() {
        let state = state_with_fee(1000, 0);
        assert_eq!(state.next_base_fee(2_000_000, 1), 700);
    }

    #[test]
    fn test_minimum_increase_is_one() {
        let state = state_with_fee(10_000_000, 0);
        assert_eq!(state.next_base_fee(state.target + 1, 1), 10_000_001);
    }

    #[test]
    fn test_floor_is_respected() {
        let state = state_with_fee(10, 0);
        // Zero usage halves the fee with denominator 2
        assert_eq!(state.next_base_fee(0, 1), 5);
        assert_eq!(state.next_base_fee(0, 8), 8);
    }

    #[test]
    fn test_expired_windows() {
        let mut state = FeeWindowState::new(1000);
        state.window_duration_seconds = 10;
        assert_eq!(state.expired_windows(1000), 0);
        assert_eq!(state.expired_windows(1009), 0);
        assert_eq!(state.expired_windows(1010), 1);
        assert_eq!(state.expired_windows(1025), 2);
        assert_eq!(state.expired_windows(999), 0);
    }

    #[test]
    fn test_roll_without_expiry_keeps_usage() {
        let mut state = state_with_fee(1000, 1000);
        state.current_window_gas_used = 2_000_000;
        assert_eq!(state.roll(1000, 1), 1000);
        assert_eq!(state.current_window_gas_used, 2_000_000);
        assert_eq!(state.window_start_time, 1000);
    }

    #[test]
    fn test_roll_with_expiry_resets_window() {
        let mut state = state_with_fee(1000, 1000);
        state.current_window_gas_used = 8_000_000;
        let fee = state.roll(1001, 1);
        assert_eq!(fee, 1300);
        assert_eq!(state.current_window_gas_used, 0);
        assert_eq!(state.window_start_time, 1001);
    }

    #[test]
    fn test_roll_advances_start_by_whole_windows() {
        let mut state = state_with_fee(1000, 1000);
        state.window_duration_seconds = 10;
        state.roll(1025, 1);
        assert_eq!(state.window_start_time, 1020);
    }

    #[test]
    fn test_empty_window_applies_zero_usage_pull_only() {
        let mut rolled = state_with_fee(1000, 0);
        let fee = rolled.roll(1, 1);
        let expected = state_with_fee(1000, 0).next_base_fee(0, 1);
        assert_eq!(fee, expected);
        assert_eq!(fee, 500);
    }

    #[test]
    fn test_many_empty_windows_decay_to_floor() {
        let mut state = state_with_fee(8000, 1000);
        state.current_window_gas_used = 10_000_000;
        let after_first = state.roll(1001, 1);
        let after_many = state.roll(1100, 1);
        assert!(after_first > after_many);
        assert_eq!(after_many, 1);
        assert_eq!(state.window_start_time, 1100);
    }

    #[test]
    fn test_closed_form_matches_iteration() {
        let mut closed = state_with_fee(1_000_000, 0);
        closed.current_window_gas_used = 6_000_000;
        let closed_fee = closed.roll(4, 1);

        let mut stepped = state_with_fee(1_000_000, 0);
        stepped.current_window_gas_used = 6_000_000;
        for t in 1..=4 {
            stepped.roll(t, 1);
        }
        // Fixed-point rounding may differ by one unit
        assert!(closed_fee.abs_diff(stepped.current_base_fee) <= 1);
    }

    #[test]
    fn test_charge_scales_fee() {
        let model = FeeModel::new(
            state_with_fee(2, 0),
            FeeParams {
                min_base_fee: 1,
                gas_cost_scaler: 3,
                gas_cost_scaler_dp: 2,
            },
        );
        let quote = model.charge(100, 0);
        assert_eq!(quote.base_fee, 2);
        assert_eq!(quote.fee, 300);
        assert_eq!(model.snapshot().current_window_gas_used, 100);
    }

    #[test]
    fn test_quote_does_not_record_usage() {
        let model = FeeModel::new(state_with_fee(2, 0), FeeParams::default());
        model.quote(100, 0);
        assert_eq!(model.snapshot().current_window_gas_used, 0);
    }

    #[test]
    fn test_concurrent_charges_roll_once() {
        let model = Arc::new(FeeModel::new(state_with_fee(1000, 0), FeeParams::default()));
        model.charge(8_000_000, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = Arc::clone(&model);
                std::thread::spawn(move || model.charge(1_000, 1))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().base_fee, 1300);
        }

        let state = model.snapshot();
        assert_eq!(state.current_base_fee, 1300);
        assert_eq!(state.current_window_gas_used, 8_000);
        assert_eq!(state.window_start_time, 1);
    }
}
