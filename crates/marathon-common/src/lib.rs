//! This crate provides shared functionality used by multiple crates in the
//! project, including cryptographic utilities, encoding/decoding helpers,
//! secret handling, and a mockable time source.

pub mod clock;
pub mod crypto;
pub mod encoding;
pub mod secret;
pub mod tls;

pub use clock::Clock;
pub use secret::Secret;
