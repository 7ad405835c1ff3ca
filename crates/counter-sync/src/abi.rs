//! Contract bindings: calldata, event topics, return and revert decoding

use crate::types::{ActionKind, CounterValue, U256};
use crate::{Error, Result};
use alloy::primitives::B256;
use alloy::sol_types::{Revert, SolCall, SolError, SolEvent};

#[allow(missing_docs)]
mod bindings {
    alloy::sol! {
        interface ICounter {
            function getCount() external view returns (uint256);
            function increment() external;
            function decrement() external;

            event CounterIncremented(uint256 newCount);
            event CounterDecremented(uint256 newCount);
        }
    }
}

pub use bindings::ICounter;

const WORD: usize = 32;

/// Topic0 of the event emitted by `kind`
pub fn event_topic(kind: ActionKind) -> B256 {
    match kind {
        ActionKind::Increment => ICounter::CounterIncremented::SIGNATURE_HASH,
        ActionKind::Decrement => ICounter::CounterDecremented::SIGNATURE_HASH,
    }
}

/// Reverse lookup of [`event_topic`]
pub fn kind_for_topic(topic: &B256) -> Option<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .find(|kind| &event_topic(*kind) == topic)
}

/// Calldata for `getCount()`
pub fn get_count_calldata() -> Vec<u8> {
    ICounter::getCountCall {}.abi_encode()
}

/// Calldata for `increment()` / `decrement()`
pub fn write_calldata(kind: ActionKind) -> Vec<u8> {
    match kind {
        ActionKind::Increment => ICounter::incrementCall {}.abi_encode(),
        ActionKind::Decrement => ICounter::decrementCall {}.abi_encode(),
    }
}

/// Decode the first ABI word as the counter value.
///
/// Used for both `getCount()` return data and the `newCount` event field.
pub fn decode_count(data: &[u8]) -> Result<CounterValue> {
    let word: [u8; WORD] = data
        .get(..WORD)
        .and_then(|w| w.try_into().ok())
        .ok_or_else(|| {
            Error::Decode(format!(
                "expected at least {} bytes, got {}",
                WORD,
                data.len()
            ))
        })?;
    Ok(CounterValue(U256::from_be_bytes(word)))
}

/// Extract the message of an `Error(string)` revert payload.
///
/// Returns `None` for empty data, custom errors, and malformed payloads.
pub fn revert_reason(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        return None;
    }
    Revert::abi_decode(data).ok().map(|revert| revert.reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::hex;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(ICounter::getCountCall::SELECTOR), "a87d942c");
        assert_eq!(hex::encode(ICounter::incrementCall::SELECTOR), "d09de08a");
        assert_eq!(hex::encode(ICounter::decrementCall::SELECTOR), "2baeceb7");
        assert_eq!(get_count_calldata(), ICounter::getCountCall::SELECTOR.to_vec());
        assert_eq!(
            write_calldata(ActionKind::Decrement),
            ICounter::decrementCall::SELECTOR.to_vec()
        );
    }

    #[test]
    fn test_topic_lookup() {
        let inc = event_topic(ActionKind::Increment);
        let dec = event_topic(ActionKind::Decrement);
        assert_ne!(inc, dec);
        assert_eq!(kind_for_topic(&inc), Some(ActionKind::Increment));
        assert_eq!(kind_for_topic(&dec), Some(ActionKind::Decrement));
        assert_eq!(kind_for_topic(&B256::ZERO), None);
    }

    #[test]
    fn test_decode_count() {
        let word = U256::from(42u64).to_be_bytes::<32>();
        assert_eq!(decode_count(&word).unwrap(), CounterValue::from(42u64));
        assert!(matches!(decode_count(&word[..31]), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_count_beyond_u128() {
        let big = U256::from(u128::MAX) + U256::from(5u64);
        let value = decode_count(&big.to_be_bytes::<32>()).unwrap();
        assert_eq!(value, CounterValue(big));
        assert_eq!(value.incremented(), Some(CounterValue(big + U256::from(1u64))));
    }

    #[test]
    fn test_revert_reason_underflow() {
        let payload = Revert {
            reason: "Counter: underflow".to_string(),
        }
        .abi_encode();
        assert_eq!(payload.len(), 4 + 32 * 3);
        assert_eq!(revert_reason(&payload).as_deref(), Some("Counter: underflow"));
    }

    #[test]
    fn test_revert_reason_rejects_garbage() {
        assert_eq!(revert_reason(&[]), None);
        assert_eq!(revert_reason(&[0xde, 0xad, 0xbe, 0xef]), None);
        let mut truncated = Revert {
            reason: "Counter: underflow".to_string(),
        }
        .abi_encode();
        truncated.truncate(40);
        assert_eq!(revert_reason(&truncated), None);
    }
}
