//! ABI registry: `(address, selector) -> ABI entry` with lazily parsed
//! descriptors.
//!
//! Each entry's ABI JSON is parsed at most once no matter how many
//! decoders hit it concurrently; a parse failure is recorded in the same
//! one-shot slot and every later hit observes the failure.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use alloy::json_abi::{Event, Function, JsonAbi};

use almanac_common::AlmanacError;

/// Selector used for event lookups when a log carries no topics.
pub const EMPTY_TOPIC_SELECTOR: &str = "0x0";

/// One registered ABI fragment for a contract address.
#[derive(Debug)]
pub struct AbiEntry {
    pub abi_json: String,
    pub abi_name: String,
    pub abi_type: String,
    decoded: OnceLock<Result<JsonAbi, String>>,
}

impl AbiEntry {
    pub fn new(abi_json: String, abi_name: String, abi_type: String) -> Self {
        Self {
            abi_json,
            abi_name,
            abi_type,
            decoded: OnceLock::new(),
        }
    }

    /// The parsed interface. Parsing happens on the first call; the
    /// outcome (including failure) is permanent for this entry.
    pub fn decoded(&self) -> Result<&JsonAbi, AlmanacError> {
        self.decoded
            .get_or_init(|| serde_json::from_str::<JsonAbi>(&self.abi_json).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| AlmanacError::AbiParse(e.clone()))
    }

    /// The function this entry names, for `tx_call` decoding.
    pub fn function(&self) -> Result<&Function, AlmanacError> {
        let abi = self.decoded()?;
        abi.function(&self.abi_name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| {
                AlmanacError::AbiParse(format!("function {} not present in ABI", self.abi_name))
            })
    }

    /// The event this entry names, for log decoding.
    pub fn event(&self) -> Result<&Event, AlmanacError> {
        let abi = self.decoded()?;
        abi.event(&self.abi_name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| {
                AlmanacError::AbiParse(format!("event {} not present in ABI", self.abi_name))
            })
    }
}

/// `address -> selector -> entry` routing map for one customer.
pub type AbiMap = HashMap<String, HashMap<String, Arc<AbiEntry>>>;

/// ABI routing map for one customer over a crawl window.
#[derive(Debug, Clone, Default)]
pub struct CustomerUpdates {
    pub customer_id: String,
    pub abis: AbiMap,
}

/// Derive the canonical selector for a named entry of a parsed ABI:
/// `0x` + 8 hex chars for functions, the full 32-byte topic0 for events.
pub fn derive_selector(abi: &JsonAbi, name: &str, abi_type: &str) -> Result<String, AlmanacError> {
    if abi_type == "event" {
        let event = abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| AlmanacError::AbiParse(format!("event {name} not present in ABI")))?;
        Ok(format!("0x{}", hex::encode(event.selector())))
    } else {
        let function = abi
            .function(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| AlmanacError::AbiParse(format!("function {name} not present in ABI")))?;
        Ok(format!("0x{}", hex::encode(function.selector())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER_FN_ABI: &str = r#"[{
        "type": "function",
        "name": "transfer",
        "stateMutability": "nonpayable",
        "inputs": [
            {"name": "to", "type": "address"},
            {"name": "amount", "type": "uint256"}
        ],
        "outputs": [{"name": "", "type": "bool"}]
    }]"#;

    const TRANSFER_EVENT_ABI: &str = r#"[{
        "type": "event",
        "name": "Transfer",
        "anonymous": false,
        "inputs": [
            {"name": "from", "type": "address", "indexed": true},
            {"name": "to", "type": "address", "indexed": true},
            {"name": "value", "type": "uint256", "indexed": false}
        ]
    }]"#;

    #[test]
    fn test_function_selector_derivation() {
        let entry = AbiEntry::new(
            TRANSFER_FN_ABI.to_string(),
            "transfer".to_string(),
            "function".to_string(),
        );
        let abi = entry.decoded().unwrap();
        let selector = derive_selector(abi, "transfer", "function").unwrap();
        assert_eq!(selector, "0xa9059cbb");
    }

    #[test]
    fn test_event_selector_derivation() {
        let entry = AbiEntry::new(
            TRANSFER_EVENT_ABI.to_string(),
            "Transfer".to_string(),
            "event".to_string(),
        );
        let abi = entry.decoded().unwrap();
        let selector = derive_selector(abi, "Transfer", "event").unwrap();
        assert_eq!(
            selector,
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_parse_failure_is_sticky() {
        let entry = AbiEntry::new(
            "not valid json".to_string(),
            "broken".to_string(),
            "function".to_string(),
        );
        let first = entry.decoded().unwrap_err().to_string();
        let second = entry.decoded().unwrap_err().to_string();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_decodes_observe_one_descriptor() {
        let entry = Arc::new(AbiEntry::new(
            TRANSFER_FN_ABI.to_string(),
            "transfer".to_string(),
            "function".to_string(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let entry = Arc::clone(&entry);
            handles.push(tokio::spawn(async move {
                entry.decoded().unwrap() as *const JsonAbi as usize
            }));
        }

        let mut addresses = std::collections::HashSet::new();
        for handle in handles {
            addresses.insert(handle.await.unwrap());
        }
        // All tasks saw the exact same parsed descriptor.
        assert_eq!(addresses.len(), 1);
    }
}
