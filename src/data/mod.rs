//! Data layer module
//!
//! Read-only domain records handed to the outbox:
//! - Activity records and their lifecycle state
//! - Content objects (say, repost, post, pin, check-in)
//! - Remote followers

mod models;

pub use models::*;
