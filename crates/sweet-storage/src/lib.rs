//! Fingerprint history storage + dataset fetch utilities for SWEET.

mod fetch;
mod store;

pub use fetch::{
    DatasetSource, FetchError, FetcherConfig, HttpDatasetFetcher, RequestIdentity,
    SEC_COMPANY_TICKERS_URL,
};
pub use store::{FingerprintStore, LookupStore, SqliteStore, StoreError};
