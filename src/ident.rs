//! # Identifier Minting
//!
//! Every record MorphDB persists is addressed by an opaque short id of the
//! shape `prefix_XXXXX`, where each `X` is drawn uniformly from a fixed
//! 62-character alphabet. The prefix tells you what you are holding
//! (`contact_…` is an entity of noun `Contact`, `evt_…` an event, and so on),
//! the suffix is random.
//!
//! ## Collision Odds
//!
//! Entity suffixes are 10 characters (62^10 ≈ 8.4e17); everything else uses
//! 12 (62^12 ≈ 3.2e21). At tenant scale the collision probability is
//! negligible; the storage layer's primary keys still catch the astronomically
//! unlikely duplicate, and the caller may retry.

use rand::Rng;

/// The fixed 62-character alphabet: lowercase, uppercase, digits.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Suffix length for entity ids.
const ENTITY_SUFFIX_LEN: usize = 10;

/// Suffix length for event, subscription, hook, dispatch, and delivery ids.
const RECORD_SUFFIX_LEN: usize = 12;

/// Mints an id of the form `{prefix}_{suffix}` with a suffix of `len`
/// characters from the alphabet.
fn mint(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(prefix.len() + 1 + len);
    id.push_str(prefix);
    id.push('_');
    for _ in 0..len {
        let idx = rng.gen_range(0..ALPHABET.len());
        id.push(ALPHABET[idx] as char);
    }
    id
}

/// Mints an entity id for the given noun: `{noun-lowercased}_{10 chars}`.
pub fn entity_id(noun: &str) -> String {
    mint(&noun.to_lowercase(), ENTITY_SUFFIX_LEN)
}

/// Mints an event id: `evt_{12 chars}`.
pub fn event_id() -> String {
    mint("evt", RECORD_SUFFIX_LEN)
}

/// Mints a subscription id: `sub_{12 chars}`.
pub fn subscription_id() -> String {
    mint("sub", RECORD_SUFFIX_LEN)
}

/// Mints a stored verb-hook id: `hook_{12 chars}`.
pub fn hook_id() -> String {
    mint("hook", RECORD_SUFFIX_LEN)
}

/// Mints a tenant-configured integration hook id: `ihook_{12 chars}`.
pub fn integration_hook_id() -> String {
    mint("ihook", RECORD_SUFFIX_LEN)
}

/// Mints a dispatch-log entry id: `dsp_{12 chars}`.
pub fn dispatch_id() -> String {
    mint("dsp", RECORD_SUFFIX_LEN)
}

/// Mints a webhook delivery id (header-only, not persisted): `dlv_{12 chars}`.
pub fn delivery_id() -> String {
    mint("dlv", RECORD_SUFFIX_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix_of(id: &str) -> &str {
        id.rsplit('_').next().unwrap()
    }

    #[test]
    fn test_entity_id_shape() {
        let id = entity_id("Contact");
        assert!(id.starts_with("contact_"));
        assert_eq!(suffix_of(&id).len(), 10);
        assert!(suffix_of(&id).bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_record_id_shapes() {
        assert!(event_id().starts_with("evt_"));
        assert!(subscription_id().starts_with("sub_"));
        assert!(integration_hook_id().starts_with("ihook_"));
        assert!(dispatch_id().starts_with("dsp_"));
        assert!(delivery_id().starts_with("dlv_"));
        assert_eq!(suffix_of(&event_id()).len(), 12);
        assert_eq!(suffix_of(&dispatch_id()).len(), 12);
    }

    #[test]
    fn test_ids_are_distinct() {
        // Uniform 62^12 draws should never collide in a small sample.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(event_id()));
        }
    }

    #[test]
    fn test_alphabet_is_62_chars() {
        assert_eq!(ALPHABET.len(), 62);
        let unique: std::collections::HashSet<_> = ALPHABET.iter().collect();
        assert_eq!(unique.len(), 62);
    }
}
