//! Cloud REST client (C3, spec.md §6).
//!
//! "A device-credentialed REST client" behind a narrow async trait, mirroring
//! the teacher's `CloudEventsSink` seam in
//! `handlers/projectors/cloudevents/sink.rs`: one trait for the contract, one
//! concrete `reqwest`-backed implementation in `http.rs`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CloudError;

pub mod http;

pub use http::HttpCloudClient;

pub type Result<T> = std::result::Result<T, CloudError>;

/// The cloud-facing operations the rest of the crate needs (spec.md §6):
/// typed GET/POST against the configured endpoint table, and image
/// download for media caching.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Fetch a JSON document from the named endpoint (`product`,
    /// `collection`, `brand`, `planogram`, `transaction`, `prereservation`).
    async fn get(&self, api: &str, device_id: &str, customer_id: Option<&str>) -> Result<Value>;

    /// POST a JSON body to the named endpoint.
    async fn post(&self, api: &str, device_id: &str, customer_id: Option<&str>, body: Value) -> Result<Value>;

    /// Download an image by id into `dest`, returning the byte count written.
    async fn download_image(&self, media_id: &str, dest: &std::path::Path) -> Result<u64>;
}
