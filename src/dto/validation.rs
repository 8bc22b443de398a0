//! Validation helpers for DTOs and the WebSocket join handshake.

use validator::ValidationError;

/// Validates that a room slug is 1 to 64 lowercase-alphanumeric characters,
/// dashes, or underscores.
///
/// Slugs come from an external naming collaborator and double as cache file
/// names and registry keys, hence the conservative charset.
pub fn validate_room_slug(slug: &str) -> Result<(), ValidationError> {
    if slug.is_empty() || slug.len() > 64 {
        let mut err = ValidationError::new("room_slug_length");
        err.message =
            Some(format!("Room slug must be 1-64 characters (got {})", slug.len()).into());
        return Err(err);
    }

    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("room_slug_format");
        err.message = Some(
            "Room slug must contain only lowercase letters, digits, dashes, or underscores".into(),
        );
        return Err(err);
    }

    Ok(())
}

/// Validates that a participant display name is non-blank and at most 64
/// characters.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name must not be blank".into());
        return Err(err);
    }

    if name.chars().count() > 64 {
        let mut err = ValidationError::new("display_name_length");
        err.message = Some("Display name must be at most 64 characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_slug_valid() {
        assert!(validate_room_slug("38c3-crew").is_ok());
        assert!(validate_room_slug("a").is_ok());
        assert!(validate_room_slug("night_walk_2").is_ok());
    }

    #[test]
    fn test_validate_room_slug_invalid() {
        assert!(validate_room_slug("").is_err()); // empty
        assert!(validate_room_slug(&"x".repeat(65)).is_err()); // too long
        assert!(validate_room_slug("38C3-Crew").is_err()); // uppercase
        assert!(validate_room_slug("crew nacht").is_err()); // space
        assert!(validate_room_slug("crew/nacht").is_err()); // path char
    }

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Nadja").is_ok());
        assert!(validate_display_name("  ").is_err());
        assert!(validate_display_name(&"n".repeat(65)).is_err());
    }
}
