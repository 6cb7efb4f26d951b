// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core types passed between watchers and the relay bus
//!
//! These types are pure data and can be consumed by the bus without tight
//! coupling to the watcher implementations.

use crate::error::{RelayError, RelayResult};
use ethers::types::U256;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of decimal places of the normalized cross-chain unit. Matches the
/// Steem asset precision; EVM fixed-point amounts are truncated down to this
/// granularity on the way in and scaled back up on the way out.
pub const ASSET_PRECISION: u32 = 3;

const ASSET_SCALE: i64 = 1_000;

/// Normalized asset amount: integer milli-units plus an uppercase symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Amount in milli-units (10^-3 of a whole token)
    pub units: i64,
    pub symbol: String,
}

impl Asset {
    pub fn new(units: i64, symbol: impl Into<String>) -> Self {
        Self {
            units,
            symbol: symbol.into(),
        }
    }

    /// Parse a printable chain amount like `"10.000 STEEM"`.
    pub fn parse(s: &str) -> RelayResult<Self> {
        let mut parts = s.trim().split_whitespace();
        let (Some(magnitude), Some(symbol), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::Amount(format!(
                "expected '<amount> <symbol>', got {s:?}"
            )));
        };

        let (whole, frac) = match magnitude.split_once('.') {
            Some((w, f)) => (w, f),
            None => (magnitude, ""),
        };
        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
            || frac.len() > ASSET_PRECISION as usize
        {
            return Err(RelayError::Amount(format!("unparseable magnitude {magnitude:?}")));
        }

        let whole: i64 = whole
            .parse()
            .map_err(|e| RelayError::Amount(format!("magnitude {magnitude:?}: {e}")))?;
        let mut frac_units: i64 = 0;
        if !frac.is_empty() {
            frac_units = frac
                .parse::<i64>()
                .map_err(|e| RelayError::Amount(format!("magnitude {magnitude:?}: {e}")))?;
            for _ in frac.len()..ASSET_PRECISION as usize {
                frac_units *= 10;
            }
        }

        let units = whole
            .checked_mul(ASSET_SCALE)
            .and_then(|w| w.checked_add(frac_units))
            .ok_or_else(|| RelayError::Amount(format!("magnitude {magnitude:?} overflows")))?;

        Ok(Self::new(units, symbol))
    }

    /// Convert a fixed-point integer amount with `decimals` decimal places,
    /// truncating precision below milli-units.
    pub fn from_fixed_point(value: U256, decimals: u32, symbol: &str) -> RelayResult<Self> {
        let units = if decimals >= ASSET_PRECISION {
            value / U256::exp10((decimals - ASSET_PRECISION) as usize)
        } else {
            value
                .checked_mul(U256::exp10((ASSET_PRECISION - decimals) as usize))
                .ok_or_else(|| RelayError::Amount(format!("fixed-point value {value} overflows")))?
        };
        if units > U256::from(i64::MAX) {
            return Err(RelayError::Amount(format!(
                "fixed-point value {value} exceeds the representable range"
            )));
        }
        Ok(Self::new(units.as_u64() as i64, symbol))
    }

    /// Scale the amount back up to a fixed-point integer with `decimals`
    /// decimal places.
    pub fn to_fixed_point(&self, decimals: u32) -> U256 {
        let units = U256::from(self.units as u64);
        if decimals >= ASSET_PRECISION {
            units * U256::exp10((decimals - ASSET_PRECISION) as usize)
        } else {
            units / U256::exp10((ASSET_PRECISION - decimals) as usize)
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03} {}",
            self.units / ASSET_SCALE,
            self.units % ASSET_SCALE,
            self.symbol
        )
    }
}

/// Chain-native amount representation carried inside a Deposit. The bus
/// normalizes it to an [`Asset`] before persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositAmount {
    /// Printable `"<amount> <symbol>"` as carried by account-chain transfers
    Printable(String),
    /// Fixed-point integer with known decimals, as carried by token contracts
    FixedPoint {
        value: U256,
        decimals: u32,
        symbol: String,
    },
}

impl DepositAmount {
    pub fn normalize(&self) -> RelayResult<Asset> {
        match self {
            DepositAmount::Printable(s) => Asset::parse(s),
            DepositAmount::FixedPoint {
                value,
                decimals,
                symbol,
            } => Asset::from_fixed_point(*value, *decimals, symbol),
        }
    }
}

/// Parsed routing memo naming the destination of the outbound leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Destination chain name (e.g. "bsc", "steem")
    pub chain: String,
    /// Destination account or address on that chain
    pub address: String,
}

/// Match a routing memo against the configured pattern. Capture 1 is the
/// target chain, capture 2 the target address. Returns `None` when the memo
/// does not match; such transfers are ignored, not an error.
pub fn parse_route(memo: &str, pattern: &Regex) -> Option<RouteTarget> {
    let caps = pattern.captures(memo)?;
    let chain = caps.get(1)?.as_str();
    let address = caps.get(2)?.as_str();
    Some(RouteTarget {
        chain: chain.to_string(),
        address: address.to_string(),
    })
}

/// Normalized inbound transfer detected by a watcher. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    /// Chain the transfer was observed on
    pub source_chain: String,
    pub from_account: String,
    pub amount: DepositAmount,
    pub route: RouteTarget,
    /// Natural key, unique per source chain
    pub txid: String,
    pub block_num: u64,
    /// Source block timestamp, unix milliseconds
    pub observed_at_ms: i64,
}

/// Outbound transfer request issued by the bus to the destination watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Store id of the TransactionRecord this transfer settles
    pub transaction_id: i64,
    pub to_address: String,
    pub amount: Asset,
    /// Reference carried on the outbound leg (the source account)
    pub reference: String,
}

/// Events emitted by a watcher, consumed solely by the bus that owns it
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Deposit(Deposit),
    /// Outcome of an outbound transfer attempt; `Ok` carries the txid on the
    /// destination chain
    TransferSettled {
        transaction_id: i64,
        result: Result<String, String>,
    },
}
