//! Job identifiers.
//!
//! A job id has the shape `{type}_{createdAtMillis}_{payloadHash8}_{random9}`.
//! The hash part is stable for a given payload so operators can spot duplicate
//! submissions by eye; the random part keeps ids unique.

use core::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const RADIX36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const HASH_LEN: usize = 8;
const RANDOM_LEN: usize = 9;

/// Globally unique, immutable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Build the identifier for a new job of `job_type` created at `created_at_ms`.
    pub fn generate(job_type: &str, data: &Value, created_at_ms: i64) -> Self {
        Self::generate_with(job_type, data, created_at_ms, &mut rand::thread_rng())
    }

    /// Same as [`JobId::generate`] with an explicit random source.
    pub fn generate_with<R: Rng + ?Sized>(
        job_type: &str,
        data: &Value,
        created_at_ms: i64,
        rng: &mut R,
    ) -> Self {
        let random: String = (0..RANDOM_LEN)
            .map(|_| RADIX36[rng.gen_range(0..RADIX36.len())] as char)
            .collect();
        Self(format!(
            "{job_type}_{created_at_ms}_{}_{random}",
            payload_hash(data)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Short fingerprint of a payload.
///
/// Folds the JSON text with `h = (h << 5) - h + unit` over UTF-16 code units in
/// 32-bit wrapping arithmetic, renders the signed result in base 36 and keeps
/// at most eight characters (a leading `-` counts as one).
pub fn payload_hash(data: &Value) -> String {
    let text = data.to_string();
    let hash = text.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    });
    let mut rendered = to_radix36(hash);
    rendered.truncate(HASH_LEN);
    rendered
}

fn to_radix36(value: i32) -> String {
    let negative = value < 0;
    let mut magnitude = i64::from(value).unsigned_abs();
    if magnitude == 0 {
        return "0".to_owned();
    }

    let mut digits = Vec::new();
    while magnitude > 0 {
        digits.push(RADIX36[(magnitude % 36) as usize]);
        magnitude /= 36;
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
