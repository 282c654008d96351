//! Structured step results.
//!
//! Steps report results as a JSON array in their termination message. The
//! message may carry log output in front of the array, so extraction scans
//! for the first well-formed array instead of requiring the payload to be
//! pure JSON.

use serde_json::{Deserializer, Value};
use stepwise_core::ResourceResult;
use thiserror::Error;

/// Failure to extract results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// The payload is empty.
    #[error("termination message is empty")]
    Empty,

    /// No well-formed JSON array was found.
    #[error("no JSON array found in termination message")]
    NoArray,

    /// An element of the array is not a valid result record.
    #[error("result {index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

/// Parse every result record in `raw`, or none.
///
/// # Errors
///
/// Returns [`ExtractError`] when the payload is empty, contains no
/// well-formed array, or any element lacks a non-empty `name` or has
/// neither `digest` nor `value`.
pub fn extract(raw: &[u8]) -> Result<Vec<ResourceResult>, ExtractError> {
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }

    let array = text
        .char_indices()
        .filter(|(_, c)| *c == '[')
        .find_map(|(start, _)| {
            let candidate = text.get(start..)?;
            match Deserializer::from_str(candidate).into_iter::<Value>().next() {
                Some(Ok(Value::Array(items))) => Some(items),
                _ => None,
            }
        })
        .ok_or(ExtractError::NoArray)?;

    array
        .iter()
        .enumerate()
        .map(|(index, item)| record(index, item))
        .collect()
}

fn record(index: usize, item: &Value) -> Result<ResourceResult, ExtractError> {
    let invalid = |reason: &str| ExtractError::InvalidRecord {
        index,
        reason: reason.to_string(),
    };
    let object = item.as_object().ok_or_else(|| invalid("not an object"))?;

    let name = match object.get("name") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        _ => return Err(invalid("missing name")),
    };
    let text_field = |key: &str| match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(&format!("'{key}' is not a string"))),
    };
    let digest = text_field("digest")?;
    let value = text_field("value")?;
    if digest.is_none() && value.is_none() {
        return Err(invalid("neither digest nor value"));
    }

    Ok(ResourceResult {
        name,
        digest,
        value,
    })
}
