//! Field-level validation shared by the HTTP layer and the store.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid phone number: {0}")]
    Phone(String),
    #[error("invalid slug: {0}")]
    Slug(String),
    #[error("{field} must be between {min} and {max} characters")]
    Length {
        field: &'static str,
        min: usize,
        max: usize,
    },
    #[error("invalid email address")]
    Email,
    #[error("{0}")]
    Other(String),
}

/// Normalise a phone number to `+<digits>`.
///
/// Accepts spaces, dashes, dots and parentheses as separators. An 11-digit
/// number starting with the trunk prefix `8` is rewritten to country code `7`.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let mut digits = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if i == 0 => {}
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return Err(ValidationError::Phone(raw.to_string())),
        }
    }
    if digits.len() == 11 && digits.starts_with('8') && !trimmed.starts_with('+') {
        digits.replace_range(0..1, "7");
    }
    if !(10..=15).contains(&digits.len()) {
        return Err(ValidationError::Phone(raw.to_string()));
    }
    Ok(format!("+{digits}"))
}

/// Mask all but the last four digits, for logs.
pub fn mask_phone(phone: &str) -> String {
    let n = phone.chars().count();
    if n <= 4 {
        return "*".repeat(n);
    }
    let tail: String = phone.chars().skip(n - 4).collect();
    format!("{}{}", "*".repeat(n - 4), tail)
}

/// Lowercase ASCII letters, digits and single inner dashes, 1-120 chars.
pub fn validate_slug(slug: &str) -> Result<(), ValidationError> {
    let ok = !slug.is_empty()
        && slug.len() <= 120
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--");
    if ok {
        Ok(())
    } else {
        Err(ValidationError::Slug(slug.to_string()))
    }
}

/// Derive a slug from a title: ASCII alphanumerics kept, everything else
/// collapsed into single dashes.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(120);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn validate_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.trim().chars().count();
    if len < min || len > max {
        return Err(ValidationError::Length { field, min, max });
    }
    Ok(())
}

pub fn validate_password(password: &str, min_length: usize) -> Result<(), ValidationError> {
    validate_length("password", password, min_length, 128)
}

/// Deliberately loose: one `@`, non-empty local part, dotted domain.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && email.len() <= 254 =>
        {
            Ok(())
        }
        _ => Err(ValidationError::Email),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalisation() {
        assert_eq!(normalize_phone("+7 (999) 123-45-67").unwrap(), "+79991234567");
        assert_eq!(normalize_phone("8 999 123 45 67").unwrap(), "+79991234567");
        assert_eq!(normalize_phone("+44 20 7946 0958").unwrap(), "+442079460958");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+7999abc4567").is_err());
        assert!(normalize_phone("7+9991234567").is_err());
    }

    #[test]
    fn phone_masking() {
        assert_eq!(mask_phone("+79991234567"), "********4567");
        assert_eq!(mask_phone("123"), "***");
    }

    #[test]
    fn slugs() {
        assert!(validate_slug("best-beaches-2026").is_ok());
        assert!(validate_slug("Bad").is_err());
        assert!(validate_slug("-lead").is_err());
        assert!(validate_slug("double--dash").is_err());
        assert!(validate_slug("").is_err());
        assert_eq!(slugify("  Top 10 Beaches: Turkey & Egypt! "), "top-10-beaches-turkey-egypt");
    }

    #[test]
    fn lengths_and_email() {
        assert!(validate_password("short", 8).is_err());
        assert!(validate_password("long enough", 8).is_ok());
        assert!(validate_email("anna@example.com").is_ok());
        assert!(validate_email("anna@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
    }
}
