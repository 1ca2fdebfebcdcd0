//! Bencode decoder
//!
//! Recursive descent over a shared sibling parser. The sibling parser reads
//! values one after another until it meets an `e` terminator or runs out of
//! input, which is what lets lists, dictionaries and the top level share it.

use anyhow::Result;
use tracing::trace;

use super::value::{Dict, Value};
use crate::error::TorrentError;

/// Deepest container nesting accepted before the input is rejected
const MAX_DEPTH: usize = 64;

/// Decode the first top-level value in `data`.
///
/// Anything after the first complete value is ignored.
pub fn decode(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Err(TorrentError::format_error("Cannot decode empty input").into());
    }

    let (values, _) = decode_list(data)?;
    values
        .into_iter()
        .next()
        .ok_or_else(|| TorrentError::format_error("No value found in input").into())
}

/// Decode consecutive top-level values.
///
/// Returns the values together with the number of bytes consumed. Stops at
/// the first `e` byte at the top level or at the end of the input.
pub fn decode_list(data: &[u8]) -> Result<(Vec<Value>, usize)> {
    let mut pos = 0;
    let values = decode_siblings(data, &mut pos, 0)?;
    trace!("Decoded {} top-level values from {} bytes", values.len(), pos);
    Ok((values, pos))
}

fn decode_siblings(data: &[u8], pos: &mut usize, depth: usize) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while *pos < data.len() && data[*pos] != b'e' {
        values.push(decode_value(data, pos, depth)?);
    }
    Ok(values)
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(TorrentError::format_error(format!("Nesting deeper than {} levels", MAX_DEPTH)).into());
    }

    match data[*pos] {
        b'i' => decode_integer(data, pos),
        b'l' => {
            *pos += 1;
            let items = decode_siblings(data, pos, depth + 1)?;
            skip_terminator(data, pos);
            Ok(Value::List(items))
        }
        b'd' => {
            *pos += 1;
            let items = decode_siblings(data, pos, depth + 1)?;
            skip_terminator(data, pos);
            build_dict(items).map(Value::Dict)
        }
        b'0'..=b'9' => decode_bytes(data, pos),
        other => Err(TorrentError::format_error(format!(
            "Unexpected byte 0x{:02x} at offset {}",
            other, *pos
        ))
        .into()),
    }
}

/// An unterminated container simply ends with the input.
fn skip_terminator(data: &[u8], pos: &mut usize) {
    if *pos < data.len() && data[*pos] == b'e' {
        *pos += 1;
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos + 1;
    let end = data[start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|p| start + p)
        .ok_or_else(|| TorrentError::format_error(format!("Unterminated integer at offset {}", *pos)))?;

    let text = std::str::from_utf8(&data[start..end])
        .map_err(|e| TorrentError::format_error_with_source("Integer is not ASCII", e.to_string()))?;
    let value: i64 = text
        .parse()
        .map_err(|e: std::num::ParseIntError| {
            TorrentError::format_error_with_source(format!("Invalid integer {:?}", text), e.to_string())
        })?;

    *pos = end + 1;
    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Value> {
    let colon = data[*pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|p| *pos + p)
        .ok_or_else(|| TorrentError::format_error(format!("Byte string at offset {} has no ':'", *pos)))?;

    let text = std::str::from_utf8(&data[*pos..colon])
        .map_err(|e| TorrentError::format_error_with_source("Length prefix is not ASCII", e.to_string()))?;
    let length: usize = text
        .parse()
        .map_err(|e: std::num::ParseIntError| {
            TorrentError::format_error_with_source(format!("Invalid length prefix {:?}", text), e.to_string())
        })?;

    let start = colon + 1;
    let end = start
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            TorrentError::format_error(format!(
                "Byte string length {} exceeds the {} bytes remaining",
                length,
                data.len() - start
            ))
        })?;

    *pos = end;
    Ok(Value::Bytes(data[start..end].to_vec()))
}

fn build_dict(items: Vec<Value>) -> Result<Dict> {
    if items.len() % 2 != 0 {
        return Err(TorrentError::format_error(format!(
            "Dictionary has an odd number of elements ({})",
            items.len()
        ))
        .into());
    }

    let mut dict = Dict::new();
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        match key {
            Value::Bytes(k) => {
                dict.insert(k, value);
            }
            other => {
                return Err(TorrentError::format_error(format!(
                    "Dictionary key must be a byte string, found {}",
                    other.kind()
                ))
                .into());
            }
        }
    }
    Ok(dict)
}
