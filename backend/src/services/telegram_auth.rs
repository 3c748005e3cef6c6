//! # Telegram Login Verification
//!
//! Checks a Telegram login widget payload:
//!
//! ```text
//! data_check_string = sorted "key=value" lines, "hash" excluded, joined by "\n"
//! secret_key        = SHA256(bot_token)
//! valid             = hex(HMAC_SHA256(secret_key, data_check_string)) == hash
//!                     and now - auth_date <= max age
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::error::WalletError;

type HmacSha256 = Hmac<Sha256>;

/// A verified Telegram user.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramIdentity {
    /// Telegram user id, used as the external id.
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub auth_date: DateTime<Utc>,
}

impl TelegramIdentity {
    /// Name to show when linking.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name, &self.username) {
            (Some(first), Some(last), _) => format!("{} {}", first, last),
            (Some(first), None, _) => first.clone(),
            (None, _, Some(username)) => username.clone(),
            _ => self.id.clone(),
        }
    }
}

/// Render a payload value the way Telegram signs it.
pub fn field_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn data_check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != "hash")
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn keyed_mac(fields: &BTreeMap<String, String>, bot_token: &str) -> Result<HmacSha256, WalletError> {
    let secret = Sha256::digest(bot_token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&secret)
        .map_err(|e| WalletError::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(data_check_string(fields).as_bytes());
    Ok(mac)
}

/// Hex HMAC over `fields` keyed with SHA256(`bot_token`).
pub fn sign_fields(fields: &BTreeMap<String, String>, bot_token: &str) -> Result<String, WalletError> {
    Ok(hex::encode(keyed_mac(fields, bot_token)?.finalize().into_bytes()))
}

/// Verify a login payload.
///
/// ## Returns
///
/// * `Ok(TelegramIdentity)` - Signature matches and the payload is fresh
/// * `Err(PermissionDenied)` - Bad signature, stale payload, or no bot token
/// * `Err(InvalidArgument)` - Missing `id`, `hash` or `auth_date`
pub fn verify_login(
    fields: &BTreeMap<String, String>,
    bot_token: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<TelegramIdentity, WalletError> {
    if bot_token.is_empty() {
        return Err(WalletError::PermissionDenied(
            "telegram login is not configured".to_string(),
        ));
    }

    let hash = fields
        .get("hash")
        .ok_or_else(|| WalletError::invalid("hash is required"))?;
    let id = fields
        .get("id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WalletError::invalid("id is required"))?;
    let auth_date: i64 = fields
        .get("auth_date")
        .ok_or_else(|| WalletError::invalid("auth_date is required"))?
        .parse()
        .map_err(|_| WalletError::invalid("auth_date must be a unix timestamp"))?;

    let expected = hex::decode(hash)
        .map_err(|_| WalletError::PermissionDenied("malformed hash".to_string()))?;
    keyed_mac(fields, bot_token)?
        .verify_slice(&expected)
        .map_err(|_| WalletError::PermissionDenied("login hash mismatch".to_string()))?;

    let auth_date = DateTime::<Utc>::from_timestamp(auth_date, 0)
        .ok_or_else(|| WalletError::invalid("auth_date out of range"))?;
    if now - auth_date > max_age {
        return Err(WalletError::PermissionDenied("login payload expired".to_string()));
    }

    Ok(TelegramIdentity {
        id: id.clone(),
        first_name: fields.get("first_name").cloned(),
        last_name: fields.get("last_name").cloned(),
        username: fields.get("username").cloned(),
        auth_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "123456:TEST-TOKEN";

    fn payload(now: DateTime<Utc>) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), "42".to_string());
        fields.insert("first_name".to_string(), "Alice".to_string());
        fields.insert("username".to_string(), "alice".to_string());
        fields.insert("auth_date".to_string(), now.timestamp().to_string());
        let hash = sign_fields(&fields, TOKEN).unwrap();
        fields.insert("hash".to_string(), hash);
        fields
    }

    #[test]
    fn test_data_check_string_is_sorted_without_hash() {
        let mut fields = BTreeMap::new();
        fields.insert("username".to_string(), "a".to_string());
        fields.insert("auth_date".to_string(), "1".to_string());
        fields.insert("hash".to_string(), "ff".to_string());
        assert_eq!(data_check_string(&fields), "auth_date=1\nusername=a");
    }

    #[test]
    fn test_valid_payload() {
        let now = Utc::now();
        let identity = verify_login(&payload(now), TOKEN, Duration::hours(24), now).unwrap();
        assert_eq!(identity.id, "42");
        assert_eq!(identity.display_name(), "Alice");
    }

    #[test]
    fn test_tampered_payload_is_denied() {
        let now = Utc::now();
        let mut fields = payload(now);
        fields.insert("id".to_string(), "43".to_string());

        let result = verify_login(&fields, TOKEN, Duration::hours(24), now);
        assert!(matches!(result, Err(WalletError::PermissionDenied(_))));

        let wrong_token = verify_login(&payload(now), "other", Duration::hours(24), now);
        assert!(matches!(wrong_token, Err(WalletError::PermissionDenied(_))));
    }

    #[test]
    fn test_stale_payload_is_denied() {
        let signed_at = Utc::now() - Duration::hours(25);
        let result = verify_login(&payload(signed_at), TOKEN, Duration::hours(24), Utc::now());
        assert_eq!(
            result,
            Err(WalletError::PermissionDenied("login payload expired".to_string()))
        );
    }

    #[test]
    fn test_missing_fields() {
        let now = Utc::now();
        let mut fields = payload(now);
        fields.remove("hash");
        let result = verify_login(&fields, TOKEN, Duration::hours(24), now);
        assert!(matches!(result, Err(WalletError::InvalidArgument(_))));
    }

    #[test]
    fn test_field_to_string() {
        assert_eq!(field_to_string(&serde_json::json!(42)), "42");
        assert_eq!(field_to_string(&serde_json::json!("x")), "x");
    }
}
