//! Status-page aggregation and slug rules.

use regex::Regex;
use std::sync::OnceLock;

use crate::db::CheckStatus;

/// True iff every counted member is up. Disabled members are not counted;
/// a page with no counted members is operational.
pub fn page_operational<I>(statuses: I) -> bool
where
    I: IntoIterator<Item = CheckStatus>,
{
    statuses
        .into_iter()
        .filter(|s| *s != CheckStatus::Disabled)
        .all(|s| s == CheckStatus::Up)
}

/// Slugs are lowercase `[a-z0-9_-]+` without a `--` sequence.
pub fn validate_slug(slug: &str) -> Result<(), String> {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    let re = SLUG.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").unwrap());

    if !re.is_match(slug) {
        return Err(format!("slug {:?} may only contain a-z, 0-9, '_' and '-'", slug));
    }
    if slug.contains("--") {
        return Err(format!("slug {:?} must not contain '--'", slug));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use CheckStatus::*;

    #[test]
    fn test_page_operational() {
        assert!(page_operational([Up, Up, Up]));
        assert!(!page_operational([Up, Down, Up]));
        assert!(!page_operational([Up, Warn]));
        assert!(!page_operational([Up, Degraded]));
        assert!(!page_operational([Unknown]));
        assert!(page_operational([Up, Disabled]));
        assert!(page_operational(Vec::new()));
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("main-site_2").is_ok());
        assert!(validate_slug("a--b").is_err());
        assert!(validate_slug("Upper").is_err());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("with space").is_err());
    }
}
