use crate::error::{Error, Result};
use rand::RngCore;

fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        10..=15 => char::from(b'a' + (nibble - 10)),
        _ => '0',
    }
}

/// Lowercase hex string of `2 * bytes` characters drawn from OS randomness.
///
/// # Errors
/// Returns an error if the OS random source cannot be read.
pub fn random_hex(bytes: usize) -> Result<String> {
    let mut raw = vec![0_u8; bytes];
    rand::rngs::OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|err| Error::io("read OS randomness", std::io::Error::other(err)))?;

    let mut out = String::with_capacity(bytes.saturating_mul(2));
    for b in raw {
        out.push(hex_digit(b >> 4));
        out.push(hex_digit(b & 0x0f));
    }
    Ok(out)
}

/// An 8-character token identifying one lock acquisition or temp file.
///
/// # Errors
/// Returns an error if the OS random source cannot be read.
pub fn token8() -> Result<String> {
    random_hex(4)
}
