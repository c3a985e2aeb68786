//! Chain whitelist and per-chain table name resolution.
//!
//! Block, transaction and label tables are named `<chain>_blocks`,
//! `<chain>_transactions` and `<chain>_labels`. Only whitelisted chains
//! resolve; anything else is rejected before a query is built.

use crate::error::AlmanacError;

/// Chains the indexer knows how to crawl.
pub const KNOWN_CHAINS: &[&str] = &[
    "arbitrum_one",
    "arbitrum_sepolia",
    "b3",
    "b3_sepolia",
    "ethereum",
    "game7",
    "game7_orbit_arbitrum_sepolia",
    "game7_testnet",
    "imx_zkevm",
    "imx_zkevm_sepolia",
    "mantle",
    "mantle_sepolia",
    "polygon",
    "ronin",
    "ronin_saigon",
    "sepolia",
    "xai",
    "xai_sepolia",
];

fn table_name(chain: &str, suffix: &str) -> Result<String, AlmanacError> {
    if KNOWN_CHAINS.contains(&chain) {
        Ok(format!("{chain}_{suffix}"))
    } else {
        Err(AlmanacError::UnsupportedChain(chain.to_string()))
    }
}

pub fn blocks_table_name(chain: &str) -> Result<String, AlmanacError> {
    table_name(chain, "blocks")
}

pub fn transactions_table_name(chain: &str) -> Result<String, AlmanacError> {
    table_name(chain, "transactions")
}

pub fn labels_table_name(chain: &str) -> Result<String, AlmanacError> {
    table_name(chain, "labels")
}

/// Table receiving raw transaction mirrors in a customer database.
pub fn customer_transactions_table_name(chain: &str) -> String {
    format!("{chain}_transactions")
}

/// Whether blocks of this chain carry an L1 anchor (`l1_block_number`).
pub fn is_chain_with_l1(chain: &str) -> bool {
    matches!(
        chain,
        "arbitrum_one"
            | "arbitrum_sepolia"
            | "game7"
            | "game7_orbit_arbitrum_sepolia"
            | "game7_testnet"
            | "xai"
            | "xai_sepolia"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_names_resolve_for_known_chains() {
        for chain in KNOWN_CHAINS {
            assert_eq!(blocks_table_name(chain).unwrap(), format!("{chain}_blocks"));
            assert_eq!(
                transactions_table_name(chain).unwrap(),
                format!("{chain}_transactions")
            );
            assert_eq!(labels_table_name(chain).unwrap(), format!("{chain}_labels"));
        }
    }

    #[test]
    fn test_table_names_are_injective() {
        let names: HashSet<String> = KNOWN_CHAINS
            .iter()
            .map(|c| blocks_table_name(c).unwrap())
            .collect();
        assert_eq!(names.len(), KNOWN_CHAINS.len());
    }

    #[test]
    fn test_unknown_chain_rejected() {
        assert!(blocks_table_name("dogecoin").is_err());
        assert!(transactions_table_name("").is_err());
        assert!(labels_table_name("Ethereum").is_err()); // case sensitive
    }

    #[test]
    fn test_l1_anchor_flag() {
        assert!(is_chain_with_l1("arbitrum_one"));
        assert!(is_chain_with_l1("xai_sepolia"));
        assert!(is_chain_with_l1("game7_testnet"));
        assert!(!is_chain_with_l1("ethereum"));
        assert!(!is_chain_with_l1("mantle"));
        assert!(!is_chain_with_l1("ronin"));
    }
}
