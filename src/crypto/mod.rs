//! Key handling for tunnel configuration
//!
//! Only Curve25519 public-key derivation is needed here; the data plane
//! cryptography lives in the interface driver.

pub mod x25519;
