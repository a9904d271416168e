//! Opaque pagination cursors.
//!
//! Cursors encode a plain row offset. Control-plane listings are small; the
//! opacity exists so clients never depend on the representation.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;

use crate::error::{BayError, Result};

/// One page of results plus the cursor for the next page, if any.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows: the extra row signals
    /// another page exists and is not returned.
    pub fn from_rows(mut rows: Vec<T>, offset: u64, limit: u64) -> Self {
        let has_more = rows.len() as u64 > limit;
        if has_more {
            rows.truncate(limit as usize);
        }
        Page {
            items: rows,
            next_cursor: has_more.then(|| encode_cursor(offset + limit)),
        }
    }
}

pub fn encode_cursor(offset: u64) -> String {
    URL_SAFE_NO_PAD.encode(format!("o:{offset}"))
}

pub fn decode_cursor(cursor: &str) -> Result<u64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| BayError::validation("malformed cursor"))?;
    let text = String::from_utf8(bytes).map_err(|_| BayError::validation("malformed cursor"))?;
    let offset = text
        .strip_prefix("o:")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| BayError::validation("malformed cursor"))?;
    Ok(offset)
}
