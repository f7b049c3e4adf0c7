//! Federation module
//!
//! Handles:
//! - Outbound delivery queue, worker, retry/backoff and dedupe
//! - Pull/cursor protocol with signed bearer tokens
//! - Issuer public key caching
//! - Replay defense via signature nonces

mod delivery;
mod key_cache;
mod pull;

pub use delivery::{DeliveryQueue, DeliveryResult, DeliverySettings, backoff_delay, dedupe_hash};
pub use key_cache::IssuerKeyCache;
pub use pull::{PULL_SCOPE, PullClaims, PullProtocol, VerifiedPull, state_hash};
