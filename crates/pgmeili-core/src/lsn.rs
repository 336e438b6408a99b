//! LSN (Log Sequence Number) helpers.
//!
//! Positions are carried as `u64` everywhere; the `X/Y` text form is only
//! used at the SQL boundary and in logs.

use crate::error::{Error, Result};

/// Parse LSN from "X/Y" format to u64.
pub fn parse_lsn(lsn: &str) -> Result<u64> {
    let (high, low) = lsn
        .split_once('/')
        .ok_or_else(|| Error::InvalidLsn(lsn.to_string()))?;

    let high = u64::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;
    let low = u64::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(lsn.to_string()))?;

    if high > u32::MAX as u64 || low > u32::MAX as u64 {
        return Err(Error::InvalidLsn(lsn.to_string()));
    }

    Ok((high << 32) | low)
}

/// Format u64 LSN to "X/Y" format.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}
