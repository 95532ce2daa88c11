// kiln-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::{Downloader, Fetch, HttpFetcher, RetryPolicy};
pub use validation::{sha256_hex, validate_url, verify_bytes, verify_checksum};
