// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing of launch memory targets

use thiserror::Error;

const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseTargetError {
    #[error("invalid target string {0:?}")]
    Invalid(String),
    #[error("target {0:?} is too large")]
    Overflow(String),
}

/// Converts a memory size such as `"512MB"`, `"2gb"` or `"4096"` into a
/// number of 4 KiB pages, never less than one.
pub fn target_pages(target: &str) -> Result<u64, ParseTargetError> {
    let lower = target.to_ascii_lowercase();
    let digits_end =
        lower.find(|c: char| !c.is_ascii_digit()).unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(digits_end);
    if digits.is_empty() {
        return Err(ParseTargetError::Invalid(target.to_string()));
    }
    let shift = match unit {
        "tb" => 40,
        "gb" => 30,
        "mb" => 20,
        "kb" => 10,
        "b" | "" => 0,
        _ => return Err(ParseTargetError::Invalid(target.to_string())),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ParseTargetError::Overflow(target.to_string()))?;
    let bytes = value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| ParseTargetError::Overflow(target.to_string()))?;
    Ok(std::cmp::max(1, bytes >> PAGE_SHIFT))
}
