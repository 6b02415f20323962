//! Content keys used for change detection.

use sha2::{Digest, Sha256};

use crate::models::GeoPoint;

/// Computes the content key of a portal observation.
///
/// The key is a SHA-256 hex digest over `lat_e6|lng_e6|name|guid`, with the
/// literal `null` standing in for a missing guid. Two observations with equal
/// keys carry the same information, so merging the second one is a no-op.
///
/// # Examples
///
/// ```
/// use discoverer_core::identity::compute_content_key;
/// use discoverer_core::models::GeoPoint;
///
/// let a = compute_content_key("Fountain", None, GeoPoint::new(45_000_000, -120_000_000));
/// let b = compute_content_key("Fountain", None, GeoPoint::new(45_000_000, -120_000_000));
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn compute_content_key(name: &str, guid: Option<&str>, location: GeoPoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}",
            location.lat_e6,
            location.lng_e6,
            name,
            guid.unwrap_or("null")
        )
        .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

/// Hashes an arbitrary canonical string into a 64 character hex digest.
pub(crate) fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}
