//! UPC ⇄ SGTIN-96 EPC conversion.
//!
//! Bit layout, most significant first:
//!
//! ```text
//! | header 8 | filter 3 | partition 3 | company prefix 24 | item ref 20 | serial 38 |
//! ```
//!
//! The company prefix is the first six UPC digits (written as the seven-digit
//! GS1 prefix `0dddddd`), the item reference is the next five. The UPC check
//! digit is not carried; decoding recomputes it.

use crate::error::{Error, Result};
use serde::Serialize;
use std::ops::RangeInclusive;

/// SGTIN-96 header byte.
pub const HEADER: u128 = 0b0011_0000;
/// Filter value (point-of-sale item).
pub const FILTER: u128 = 0b001;
/// Partition value for a 7-digit company prefix.
pub const PARTITION: u128 = 0b101;
/// Largest serial that fits in the 38-bit field.
pub const MAX_SERIAL: u64 = (1 << SERIAL_BITS) - 1;

const FILTER_BITS: u32 = 3;
const PARTITION_BITS: u32 = 3;
const PREFIX_BITS: u32 = 24;
const ITEM_BITS: u32 = 20;
const SERIAL_BITS: u32 = 38;

const SERIAL_SHIFT: u32 = 0;
const ITEM_SHIFT: u32 = SERIAL_SHIFT + SERIAL_BITS;
const PREFIX_SHIFT: u32 = ITEM_SHIFT + ITEM_BITS;
const PARTITION_SHIFT: u32 = PREFIX_SHIFT + PREFIX_BITS;
const FILTER_SHIFT: u32 = PARTITION_SHIFT + PARTITION_BITS;
const HEADER_SHIFT: u32 = FILTER_SHIFT + FILTER_BITS;

const fn mask(bits: u32) -> u128 {
    (1 << bits) - 1
}

/// A decoded tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedEpc {
    /// Reconstructed 12-digit UPC, check digit included.
    pub upc: String,
    /// Serial number.
    pub serial: u64,
}

/// Exactly 12 ASCII digits.
#[must_use]
pub fn validate_upc(upc: &str) -> bool {
    upc.len() == 12 && upc.bytes().all(|b| b.is_ascii_digit())
}

/// UPC-A check digit for the first 11 digits: odd positions weigh 3, even weigh 1.
///
/// # Errors
/// Returns [`Error::Validation`] unless `upc11` is exactly 11 ASCII digits.
pub fn check_digit(upc11: &str) -> Result<u8> {
    if upc11.len() != 11 || !upc11.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "check digit needs 11 digits, got {upc11:?}"
        )));
    }
    let sum: u32 = upc11
        .bytes()
        .enumerate()
        .map(|(idx, b)| {
            let digit = u32::from(b - b'0');
            if idx % 2 == 0 {
                digit * 3
            } else {
                digit
            }
        })
        .sum();
    let digit = (10 - sum % 10) % 10;
    u8::try_from(digit).map_err(|_| Error::Validation(format!("check digit {digit} out of range")))
}

/// Whether a 12-digit UPC ends in its correct check digit.
#[must_use]
pub fn has_valid_check_digit(upc: &str) -> bool {
    if !validate_upc(upc) {
        return false;
    }
    match (upc.get(..11), upc.get(11..)) {
        (Some(body), Some(last)) => {
            check_digit(body).is_ok_and(|d| last == char::from(b'0' + d).to_string())
        }
        _ => false,
    }
}

/// Append the check digit to an 11-digit UPC body.
///
/// # Errors
/// Returns [`Error::Validation`] unless `upc11` is exactly 11 ASCII digits.
pub fn complete_upc(upc11: &str) -> Result<String> {
    let digit = check_digit(upc11)?;
    Ok(format!("{upc11}{digit}"))
}

fn digits(upc: &str, range: std::ops::Range<usize>) -> Result<u128> {
    upc.get(range)
        .and_then(|s| s.parse::<u128>().ok())
        .ok_or_else(|| Error::Validation(format!("malformed UPC {upc:?}")))
}

/// Encode a UPC and serial as 24 uppercase hex characters.
///
/// # Errors
/// Returns [`Error::Validation`] when the UPC is not 12 digits, its check digit
/// is wrong, or the serial exceeds [`MAX_SERIAL`].
pub fn encode(upc: &str, serial: u64) -> Result<String> {
    if !validate_upc(upc) {
        return Err(Error::Validation(format!(
            "UPC must be exactly 12 digits, got {upc:?}"
        )));
    }
    if !has_valid_check_digit(upc) {
        return Err(Error::Validation(format!("UPC {upc} has a wrong check digit")));
    }
    if serial > MAX_SERIAL {
        return Err(Error::Validation(format!(
            "serial {serial} does not fit in 38 bits"
        )));
    }

    let prefix = digits(upc, 0..6)?;
    let item = digits(upc, 6..11)?;
    let value = (HEADER << HEADER_SHIFT)
        | (FILTER << FILTER_SHIFT)
        | (PARTITION << PARTITION_SHIFT)
        | (prefix << PREFIX_SHIFT)
        | (item << ITEM_SHIFT)
        | (u128::from(serial) << SERIAL_SHIFT);
    Ok(format!("{value:024X}"))
}

/// Encode every serial of an allocated block.
///
/// # Errors
/// Fails on the first serial [`encode`] rejects.
pub fn encode_range(upc: &str, serials: RangeInclusive<u64>) -> Result<Vec<String>> {
    serials.map(|serial| encode(upc, serial)).collect()
}

/// Decode 24 hex characters back into a UPC and serial.
///
/// # Errors
/// Returns [`Error::Validation`] for wrong length, non-hex input, unexpected
/// header/filter/partition values, or field values a UPC cannot hold.
pub fn decode(hex: &str) -> Result<DecodedEpc> {
    let hex = hex.trim();
    if hex.len() != 24 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "EPC must be 24 hex characters, got {hex:?}"
        )));
    }
    let value = u128::from_str_radix(hex, 16)
        .map_err(|err| Error::Validation(format!("EPC {hex:?} is not hex: {err}")))?;

    let field = |shift: u32, bits: u32| (value >> shift) & mask(bits);
    let header = field(HEADER_SHIFT, 8);
    let filter = field(FILTER_SHIFT, FILTER_BITS);
    let partition = field(PARTITION_SHIFT, PARTITION_BITS);
    if header != HEADER || filter != FILTER || partition != PARTITION {
        return Err(Error::Validation(format!(
            "EPC {hex} is not a UPC-derived SGTIN-96 (header {header:#04x}, filter {filter}, partition {partition})"
        )));
    }

    let prefix = field(PREFIX_SHIFT, PREFIX_BITS);
    let item = field(ITEM_SHIFT, ITEM_BITS);
    if prefix > 999_999 || item > 99_999 {
        return Err(Error::Validation(format!(
            "EPC {hex} carries a company prefix or item reference outside UPC range"
        )));
    }
    let serial = u64::try_from(field(SERIAL_SHIFT, SERIAL_BITS))
        .map_err(|_| Error::Validation(format!("EPC {hex} serial out of range")))?;

    let upc = complete_upc(&format!("{prefix:06}{item:05}"))?;
    Ok(DecodedEpc { upc, serial })
}
