//! ABI bindings for the ERC-20 surface the indexer consumes.
//!
//! Type-safe Rust bindings generated with the `alloy::sol!` macro. The
//! indexer only decodes the standard `Transfer` event; the read-only
//! metadata functions (`symbol`, `decimals`, `name`) back the token
//! metadata cache.
//!
//! # Usage
//!
//! Events are decoded from raw logs using the `SolEvent` trait:
//!
//! ```ignore
//! use alloy::sol_types::SolEvent;
//! use tokenflow_indexer::abi::IERC20::Transfer;
//!
//! let event = Transfer::decode_log(&log.inner)?;
//! println!("{} -> {}: {}", event.from, event.to, event.value);
//! ```

use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    /// Minimal ERC-20 interface: the transfer event plus the metadata
    /// getters used to enrich persisted transfers.
    #[sol(rpc)]
    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        /// Standard ERC-20 transfer event.
        ///
        /// Note: `from` is 0x0 for mints; `to` is 0x0 for burns.
        event Transfer(address indexed from, address indexed to, uint256 value);

        /// Token symbol, e.g. "USDC".
        function symbol() external view returns (string);

        /// Token decimals, typically 18.
        function decimals() external view returns (uint8);

        /// Full token name.
        function name() external view returns (string);
    }
}

/// topic0 of `Transfer(address,address,uint256)`.
///
/// `0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef`
pub const TRANSFER_TOPIC: B256 = IERC20::Transfer::SIGNATURE_HASH;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_topic_matches_keccak_of_signature() {
        assert_eq!(
            format!("{TRANSFER_TOPIC:#x}"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn transfer_signature_is_canonical() {
        assert_eq!(IERC20::Transfer::SIGNATURE, "Transfer(address,address,uint256)");
    }
}
