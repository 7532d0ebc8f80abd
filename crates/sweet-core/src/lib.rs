//! Core domain model for SWEET: payload fingerprints, history records and
//! the company ticker dataset.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest ticker symbol accepted into the lookup table.
pub const MAX_TICKER_LEN: usize = 10;

/// SHA-256 digest of an exact byte sequence.
///
/// Rendered as 64 lowercase hex characters, which is also the form persisted
/// in the history table. Equality is byte-for-byte on the digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hashes the raw bytes directly; no decoding or re-rendering happens first.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(String),
    #[error("fingerprint must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|err| FingerprintError::InvalidHex(err.to_string()))?;
        let len = bytes.len();
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FingerprintError::InvalidLength(len))?;
        Ok(Self(digest))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One row of the append-only update history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

/// Persisted row of the CIK lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub id: i64,
    pub cik: String,
    pub ticker: String,
    pub title: String,
    pub visible: bool,
}

/// One company entry from the published ticker document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyTicker {
    pub cik: String,
    pub ticker: String,
    pub title: String,
}

impl CompanyTicker {
    fn validate(&self) -> Result<(), String> {
        if self.cik.trim().is_empty() {
            return Err("empty cik".to_string());
        }
        if self.ticker.trim().is_empty() {
            return Err("empty ticker".to_string());
        }
        if self.ticker.chars().count() > MAX_TICKER_LEN {
            return Err(format!(
                "ticker {:?} longer than {MAX_TICKER_LEN} characters",
                self.ticker
            ));
        }
        if self.title.trim().is_empty() {
            return Err("empty title".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object keyed by entry index")]
    NotAnObject,
    #[error("entry {key}: {reason}")]
    InvalidEntry { key: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    cik_str: RawCik,
    ticker: String,
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCik {
    Number(u64),
    Text(String),
}

impl RawCik {
    fn into_string(self) -> String {
        match self {
            RawCik::Number(n) => n.to_string(),
            RawCik::Text(s) => s.trim().to_string(),
        }
    }
}

/// Parses the `{"0": {"cik_str": .., "ticker": .., "title": ..}, ...}` document.
///
/// Entries come back ordered by their numeric key; keys that are not numbers
/// sort first. Any malformed entry fails the whole parse.
pub fn parse_company_tickers(bytes: &[u8]) -> Result<Vec<CompanyTicker>, ParseError> {
    let document: JsonValue = serde_json::from_slice(bytes)?;
    let JsonValue::Object(entries) = document else {
        return Err(ParseError::NotAnObject);
    };

    let mut keyed = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let raw: RawTicker = serde_json::from_value(value).map_err(|err| ParseError::InvalidEntry {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        let ticker = CompanyTicker {
            cik: raw.cik_str.into_string(),
            ticker: raw.ticker.trim().to_string(),
            title: raw.title.trim().to_string(),
        };
        if let Err(reason) = ticker.validate() {
            return Err(ParseError::InvalidEntry { key, reason });
        }
        keyed.push((key.parse::<u64>().ok(), ticker));
    }

    keyed.sort_by_key(|(index, _)| *index);
    Ok(keyed.into_iter().map(|(_, ticker)| ticker).collect())
}
