// src/phone.rs

use crate::error::MessagingError;

/// Canonical storage form for patient phones: digits only, country code
/// first, no `+`. Gateways and webhooks use the same shape.
///
/// Input written in international form (`+` or `00` prefix) already carries
/// its country code and is kept as is. Otherwise numbers with 11 digits or
/// fewer are treated as national and get `country_code` prepended.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<String, MessagingError> {
    let mut s = raw.trim().to_string();

    // WhatsApp JIDs look like 5531999999999@s.whatsapp.net
    if let Some((number, _)) = s.split_once('@') {
        s = number.to_string();
    }

    let mut international = false;
    if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
        international = true;
    } else if let Some(rest) = s.strip_prefix("00") {
        s = rest.to_string();
        international = true;
    }

    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(MessagingError::InvalidPhone(format!(
            "phone number has no digits: {raw:?}"
        )));
    }

    let full = if !international && digits.len() <= 11 {
        format!("{country_code}{digits}")
    } else {
        digits
    };

    if full.len() > 15 {
        return Err(MessagingError::InvalidPhone(
            "phone number too long for E.164 (max 15 digits)".into(),
        ));
    }

    Ok(full)
}
