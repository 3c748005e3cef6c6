//! # Utilities Module
//!
//! This module contains helper functions and utilities used
//! across the backend service.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Characters used in link codes. No 0/O or 1/I to keep codes readable.
const LINK_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Longest accepted account or external id.
const MAX_ID_LEN: usize = 128;

/// Derive the ledger entry id for an idempotency key.
///
/// The id is the lowercase hex SHA-256 of the key, so the same key
/// always maps to the same entry.
///
/// ## Examples
///
/// ```rust,ignore
/// let id = derive_entry_id("ad:msg-42:acct1");
/// assert_eq!(id.len(), 64);
/// ```
pub fn derive_entry_id(idempotency_key: &str) -> String {
    hex::encode(Sha256::digest(idempotency_key.as_bytes()))
}

/// Calendar date of `now` in the reference timezone.
pub fn reference_date(now: DateTime<Utc>, offset: &FixedOffset) -> NaiveDate {
    now.with_timezone(offset).date_naive()
}

/// Generate a random link code of `len` characters.
pub fn generate_link_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LINK_CODE_ALPHABET[rng.gen_range(0..LINK_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Validate an account or external identity id.
///
/// ## Returns
///
/// * `Ok(())` - Valid id
/// * `Err(String)` - Empty, too long, or contains whitespace/control characters
pub fn validate_id(field: &str, id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{} is required", field));
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!(
            "{} is too long: {} (max {})",
            field,
            id.len(),
            MAX_ID_LEN
        ));
    }
    if let Some(c) = id.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("Invalid character in {}: {:?}", field, c));
    }
    Ok(())
}

/// Truncate a string to a maximum length.
///
/// Useful for logging long entry ids.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len || max_len < 5 {
        s.to_string()
    } else {
        let half = (max_len - 3) / 2;
        let head: String = chars[..half].iter().collect();
        let tail: String = chars[chars.len() - half..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_derive_entry_id() {
        // sha256("abc")
        assert_eq!(
            derive_entry_id("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(derive_entry_id("k1"), derive_entry_id("k1"));
        assert_ne!(derive_entry_id("k1"), derive_entry_id("k2"));
    }

    #[test]
    fn test_reference_date_crosses_midnight_early() {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();

        // 16:59 UTC is 23:59 in UTC+7, 17:00 UTC is the next day
        let before = Utc.with_ymd_and_hms(2024, 3, 10, 16, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 17, 0, 0).unwrap();
        assert_eq!(reference_date(before, &offset), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(reference_date(after, &offset), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
    }

    #[test]
    fn test_generate_link_code() {
        let code = generate_link_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| LINK_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("accountId", "acct1").is_ok());
        assert!(validate_id("accountId", "").is_err());
        assert!(validate_id("accountId", "has space").is_err());
        assert!(validate_id("accountId", &"x".repeat(129)).is_err());
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("abcdefghij", 10), "abcdefghij");
        assert_eq!(truncate_string("abcdefghijklmnop", 10), "abc...nop");
    }
}
