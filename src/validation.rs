use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{IndexError, Result};

static INDEX_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid index name regex"));

// 9999-12-31T23:59:59.999Z
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Index names are the tenant boundary: letters, digits, underscores, and
/// hyphens only.
pub fn ensure_index_name(value: &str) -> Result<()> {
    if INDEX_NAME_RE.is_match(value) {
        Ok(())
    } else {
        Err(IndexError::NameInvalid(value.to_string()))
    }
}

/// Timestamps transport as positive epoch milliseconds, capped at the end
/// of year 9999.
pub fn ensure_timestamp(value: i64) -> Result<()> {
    if (1..=MAX_TIMESTAMP_MS).contains(&value) {
        Ok(())
    } else {
        Err(IndexError::Validation(format!(
            "timestamp must be positive epoch milliseconds, got {value}"
        )))
    }
}

pub fn ensure_timestamps(values: &[i64]) -> Result<()> {
    if values.is_empty() {
        return Err(IndexError::Validation(
            "at least one timestamp is required".into(),
        ));
    }
    for &value in values {
        ensure_timestamp(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_accepts_word_characters_and_hyphens() {
        ensure_index_name("meter-data").expect("valid name");
        ensure_index_name("Meter_Data_2").expect("valid name");
    }

    #[test]
    fn index_name_rejects_everything_else() {
        for name in ["", "has space", "semi;colon", "a:b", "tab\there", "ünicode"] {
            assert!(
                matches!(ensure_index_name(name), Err(IndexError::NameInvalid(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn timestamps_must_be_positive_and_present() {
        ensure_timestamp(1_704_067_200_000).expect("valid timestamp");
        assert!(ensure_timestamp(0).is_err());
        assert!(ensure_timestamp(-5).is_err());
        assert!(ensure_timestamp(MAX_TIMESTAMP_MS + 1).is_err());
        assert!(ensure_timestamps(&[]).is_err());
        assert!(ensure_timestamps(&[1, -1]).is_err());
        ensure_timestamps(&[1, 2]).expect("valid timestamps");
    }
}
