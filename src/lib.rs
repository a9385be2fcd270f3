//! Shelfpost - ActivityPub outbox for a social cataloging platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Local save (external)                      │
//! │  - Check-ins, says, posts, pins, reposts                    │
//! │  - ActivityRecord with sharing enabled                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Publish Pipeline                         │
//! │  - Render content (Markdown, sanitized HTML, hashtags)      │
//! │  - Build Create / Update / Delete envelope                  │
//! │  - Sign once per distinct cc (RsaSignature2017)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Delivery                               │
//! │  - Shared inbox deduplication                               │
//! │  - Bounded fan-out with per-inbox timeout                   │
//! │  - Per-object ordering of Create/Update/Delete              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `federation`: Rendering, envelopes, signatures, recipients and delivery
//! - `crosspost`: Third-party crossposting run after a local save
//! - `data`: Activity records, content objects and followers
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod config;
pub mod crosspost;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

/// Wire an `Outbox` for production use
///
/// # Steps
/// 1. Build the HTTP transport (User-Agent, request timeout)
/// 2. Point key resolution at the configured key directory
///
/// # Errors
/// Returns error if the HTTP client cannot be built
pub fn build_outbox(config: &config::AppConfig) -> Result<federation::Outbox, error::AppError> {
    let transport = federation::HttpTransport::with_user_agent(
        &config.delivery.user_agent,
        config.delivery.timeout(),
    )?;
    let keys = federation::PemDirectoryKeyProvider::new(config.keys.directory.clone());

    tracing::info!(
        root_url = %config.root_url(),
        max_concurrent = config.delivery.max_concurrent,
        http_signatures = config.delivery.http_signatures,
        "Outbox initialized"
    );

    Ok(federation::Outbox::new(
        config,
        Arc::new(keys),
        Arc::new(transport),
    ))
}
