//! ActivityPub federation outbox
//!
//! Handles:
//! - Content rendering (Markdown and sanitized HTML)
//! - Envelope building (Create, Update, Delete)
//! - Envelope signatures (RsaSignature2017) and optional HTTP Signatures
//! - Signing key resolution
//! - Recipient resolution with shared inbox deduplication
//! - Bounded, isolated delivery
//! - Per-object publish ordering

mod activity;
mod delivery;
mod keys;
mod outbox;
mod recipients;
mod render;
mod signature;

pub use activity::{
    ACTIVITYSTREAMS_CONTEXT, MessageBuilder, PUBLIC_AUDIENCE, SECURITY_CONTEXT, address_to,
    local_actor_uri, local_followers_uri, local_key_id,
};
pub use delivery::{
    ACTIVITY_CONTENT_TYPE, DeliveryResult, Dispatcher, HttpTransport, OutboundDelivery,
    SequenceGate, SequenceGuard, SequenceTicket, Transport,
};
pub use keys::{InMemoryKeyProvider, KeyProvider, PemDirectoryKeyProvider, SigningKey};
pub use outbox::{Outbox, PublishReport, SIGNED_HEADERS_KEY};
pub use recipients::{DeliveryTarget, resolve_targets};
pub use render::{RenderedContent, markdown_to_html, render};
pub use signature::{
    DEFAULT_SIGNED_HEADERS, SIGNATURE_TYPE, SignatureBlock, SignatureHeaders, SignedEnvelope,
    Signer, canonical_json, generate_digest, verify_envelope, verify_signed_bytes,
};
