//! Decrement warning policy
//!
//! Decrementing at zero always reverts, and the fee is spent anyway. The
//! policy intercepts that case before anything reaches the wallet and lets
//! the operator dismiss the warning or go ahead regardless. Going ahead does
//! not look at the counter again.

use crate::types::CounterValue;
use serde::Serialize;

/// Shown when a decrement is requested at zero
pub const UNDERFLOW_WARNING: &str = "The counter is already at 0. A decrement will revert with \
     \"Counter: underflow\" and the transaction fee will not be refunded.";

/// Active warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecrementWarning {
    /// Operator-facing explanation
    pub reason: String,
    /// Value observed when the warning was raised
    pub observed: CounterValue,
}

/// What the caller should do with a decrement request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward to the write coordinator
    Submit,
    /// Hold; the operator has to decide
    Warn(DecrementWarning),
}

/// Warning state machine: `Idle -> Warned -> (dismiss | proceed) -> Idle`
#[derive(Debug, Clone, Default)]
pub struct WarningPolicy {
    active: Option<DecrementWarning>,
}

impl WarningPolicy {
    /// Policy in the idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a decrement against the last known value.
    ///
    /// An unknown value passes through; only a known zero is intercepted.
    pub fn request_decrement(&mut self, current: Option<CounterValue>) -> Decision {
        match current {
            Some(value) if value.is_zero() => {
                let warning = DecrementWarning {
                    reason: UNDERFLOW_WARNING.to_string(),
                    observed: value,
                };
                self.active = Some(warning.clone());
                Decision::Warn(warning)
            }
            _ => Decision::Submit,
        }
    }

    /// Drop the warning without submitting; returns whether one was active
    pub fn dismiss(&mut self) -> bool {
        self.active.take().is_some()
    }

    /// Leave the warned state; `true` means the caller must submit the
    /// decrement now, without re-checking the value
    pub fn proceed_anyway(&mut self) -> bool {
        self.active.take().is_some()
    }

    /// Current warning, if any
    pub fn active(&self) -> Option<&DecrementWarning> {
        self.active.as_ref()
    }
}
