//! Semantic version allocation for deployment lines.
//!
//! A *target line* is a `MAJOR.MINOR` prefix (e.g. `"2.3"`) that scopes
//! version allocation for one deployable unit. [`next_version`] computes the
//! next free version within a line, optionally staged behind a prerelease
//! tag, and [`check_latest`] finds the version currently holding a line/tag
//! slot among a set of existing versions.
//!
//! # Example
//!
//! ```
//! use slipway_version::{check_latest, next_version};
//!
//! let existing = vec!["2.3.0".to_string(), "2.3.1".to_string()];
//!
//! assert_eq!(next_version(&existing, "2.3", "").unwrap(), "2.3.2");
//! assert_eq!(next_version(&existing, "2.3", "beta").unwrap(), "2.3.2-beta.0");
//! assert_eq!(
//!     check_latest(&existing, "2.3", "").unwrap(),
//!     Some("2.3.1".to_string())
//! );
//! ```

use semver::{Prerelease, Version};
use thiserror::Error;

/// Highest prerelease counter a tagged version may carry.
pub const MAX_PRERELEASE_COUNTER: u64 = 999_999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid target line {0:?}: expected MAJOR.MINOR")]
    InvalidTargetLine(String),
    #[error("invalid prerelease tag {0:?}")]
    InvalidTag(String),
    #[error("prerelease counter exhausted for {0}")]
    CounterExhausted(String),
}

/// Parse a `MAJOR.MINOR` target line into its numeric components.
pub fn parse_line(target_line: &str) -> Result<(u64, u64), VersionError> {
    let invalid = || VersionError::InvalidTargetLine(target_line.to_string());
    let (major, minor) = target_line.split_once('.').ok_or_else(invalid)?;
    if minor.contains('.') {
        return Err(invalid());
    }
    let major = major.parse::<u64>().map_err(|_| invalid())?;
    let minor = minor.parse::<u64>().map_err(|_| invalid())?;
    Ok((major, minor))
}

/// First version of a target line, before anything has been allocated.
pub fn first_in_line(target_line: &str) -> Result<String, VersionError> {
    let (major, minor) = parse_line(target_line)?;
    Ok(Version::new(major, minor, 0).to_string())
}

fn validate_tag(tag: &str) -> Result<(), VersionError> {
    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        || tag.chars().all(|c| c.is_ascii_digit())
    {
        return Err(VersionError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

/// Versions that fail to parse as semver are skipped rather than fatal;
/// historical stores can contain strings from before allocation was strict.
fn parse_known(existing: &[String]) -> Vec<Version> {
    existing
        .iter()
        .filter_map(|s| Version::parse(s).ok())
        .collect()
}

fn in_line(v: &Version, major: u64, minor: u64) -> bool {
    v.major == major && v.minor == minor
}

/// Prerelease counter of `v` if its prerelease is exactly `<tag>.<counter>`
/// with a counter in `0..=MAX_PRERELEASE_COUNTER`.
fn tag_counter(v: &Version, tag: &str) -> Option<u64> {
    let pre = v.pre.as_str();
    let rest = pre.strip_prefix(tag)?.strip_prefix('.')?;
    let n = rest.parse::<u64>().ok()?;
    if n <= MAX_PRERELEASE_COUNTER {
        Some(n)
    } else {
        None
    }
}

/// Next untagged version in the line: patch+1 past the highest untagged
/// member, or `<line>.0` when the line is empty.
fn next_untagged(known: &[Version], major: u64, minor: u64) -> Version {
    let highest = known
        .iter()
        .filter(|v| in_line(v, major, minor) && v.pre.is_empty())
        .map(|v| v.patch)
        .max();
    match highest {
        Some(patch) => Version::new(major, minor, patch + 1),
        None => Version::new(major, minor, 0),
    }
}

/// Compute the next free version for `target_line`.
///
/// With an empty `tag` this is the next untagged patch in the line. With a
/// tag, the prerelease is staged for the next untagged patch: the highest
/// existing `<staged>-<tag>.N` counter is incremented, or the counter starts
/// at zero when no tagged version exists for that staging target.
pub fn next_version(
    existing: &[String],
    target_line: &str,
    tag: &str,
) -> Result<String, VersionError> {
    let (major, minor) = parse_line(target_line)?;
    let known = parse_known(existing);
    let staged = next_untagged(&known, major, minor);

    if tag.is_empty() {
        return Ok(staged.to_string());
    }
    validate_tag(tag)?;

    let highest = known
        .iter()
        .filter(|v| in_line(v, major, minor) && v.patch == staged.patch)
        .filter_map(|v| tag_counter(v, tag))
        .max();

    let counter = match highest {
        Some(MAX_PRERELEASE_COUNTER) => {
            return Err(VersionError::CounterExhausted(format!("{staged}-{tag}")));
        }
        Some(n) => n + 1,
        None => 0,
    };

    let mut next = staged;
    next.pre = Prerelease::new(&format!("{tag}.{counter}"))
        .map_err(|_| VersionError::InvalidTag(tag.to_string()))?;
    Ok(next.to_string())
}

/// Find the highest existing version that is a member of `target_line` under
/// `tag`, or `None` when the slot is unoccupied.
///
/// Unlike [`next_version`] this is pure membership: an empty tag matches only
/// untagged versions of the line, a non-empty tag matches only
/// `<line>.<patch>-<tag>.<counter>` versions. Build metadata is permitted and
/// preserved in the returned string.
pub fn check_latest(
    existing: &[String],
    target_line: &str,
    tag: &str,
) -> Result<Option<String>, VersionError> {
    let (major, minor) = parse_line(target_line)?;
    if !tag.is_empty() {
        validate_tag(tag)?;
    }

    let best = existing
        .iter()
        .filter_map(|s| Version::parse(s).ok().map(|v| (v, s)))
        .filter(|(v, _)| in_line(v, major, minor))
        .filter(|(v, _)| {
            if tag.is_empty() {
                v.pre.is_empty()
            } else {
                tag_counter(v, tag).is_some()
            }
        })
        .max_by(|(a, _), (b, _)| a.cmp(b));

    Ok(best.map(|(_, s)| s.clone()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_in_line_is_patch_zero() {
        assert_eq!(first_in_line("2.3").expect("line"), "2.3.0");
        assert_eq!(first_in_line("0.1").expect("line"), "0.1.0");
    }

    #[test]
    fn parse_line_rejects_malformed_lines() {
        for bad in ["2", "2.3.4", "a.b", "2.", ".3", ""] {
            assert!(parse_line(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn next_untagged_starts_line_at_zero() {
        assert_eq!(next_version(&[], "2.3", "").expect("next"), "2.3.0");
    }

    #[test]
    fn next_untagged_increments_highest_patch() {
        let existing = strings(&["2.3.0", "2.3.4", "2.3.1"]);
        assert_eq!(next_version(&existing, "2.3", "").expect("next"), "2.3.5");
    }

    #[test]
    fn next_untagged_ignores_other_lines() {
        let existing = strings(&["2.4.9", "3.0.0", "2.2.7"]);
        assert_eq!(next_version(&existing, "2.3", "").expect("next"), "2.3.0");
    }

    #[test]
    fn next_untagged_ignores_prereleases_in_line() {
        let existing = strings(&["2.3.0", "2.3.1-beta.4"]);
        assert_eq!(next_version(&existing, "2.3", "").expect("next"), "2.3.1");
    }

    #[test]
    fn tagged_allocation_starts_at_counter_zero() {
        assert_eq!(
            next_version(&[], "2.3", "beta").expect("next"),
            "2.3.0-beta.0"
        );
    }

    #[test]
    fn tagged_allocation_increments_counter() {
        let existing = strings(&["2.3.0-beta.0"]);
        assert_eq!(
            next_version(&existing, "2.3", "beta").expect("next"),
            "2.3.0-beta.1"
        );
    }

    #[test]
    fn tagged_allocation_rolls_to_next_untagged_patch() {
        let existing = strings(&["2.3.0"]);
        assert_eq!(
            next_version(&existing, "2.3", "beta").expect("next"),
            "2.3.1-beta.0"
        );
    }

    #[test]
    fn tagged_allocation_ignores_other_tags() {
        let existing = strings(&["2.3.0-beta.7", "2.3.0-rc.2"]);
        assert_eq!(
            next_version(&existing, "2.3", "beta").expect("next"),
            "2.3.0-beta.8"
        );
        assert_eq!(
            next_version(&existing, "2.3", "rc").expect("next"),
            "2.3.0-rc.3"
        );
    }

    #[test]
    fn tagged_allocation_rejects_invalid_tags() {
        assert_eq!(
            next_version(&[], "2.3", "bad tag"),
            Err(VersionError::InvalidTag("bad tag".to_string()))
        );
        assert_eq!(
            next_version(&[], "2.3", "123"),
            Err(VersionError::InvalidTag("123".to_string()))
        );
    }

    #[test]
    fn tagged_allocation_fails_when_counter_exhausted() {
        let existing = strings(&["2.3.0-beta.999999"]);
        assert_eq!(
            next_version(&existing, "2.3", "beta"),
            Err(VersionError::CounterExhausted("2.3.0-beta".to_string()))
        );
    }

    #[test]
    fn unparseable_versions_are_skipped() {
        let existing = strings(&["not-a-version", "2.3.2", "2.3"]);
        assert_eq!(next_version(&existing, "2.3", "").expect("next"), "2.3.3");
    }

    #[test]
    fn check_latest_finds_highest_untagged_member() {
        let existing = strings(&["2.3.0", "2.3.4", "2.4.0", "2.3.1-beta.0"]);
        assert_eq!(
            check_latest(&existing, "2.3", "").expect("latest"),
            Some("2.3.4".to_string())
        );
    }

    #[test]
    fn check_latest_returns_none_for_empty_slot() {
        let existing = strings(&["2.4.0", "2.3.1-beta.0"]);
        assert_eq!(check_latest(&existing, "2.3", "").expect("latest"), None);
    }

    #[test]
    fn check_latest_with_tag_matches_only_that_tag() {
        let existing = strings(&["2.3.0", "2.3.1-beta.2", "2.3.1-rc.9"]);
        assert_eq!(
            check_latest(&existing, "2.3", "beta").expect("latest"),
            Some("2.3.1-beta.2".to_string())
        );
    }

    #[test]
    fn check_latest_preserves_build_metadata() {
        let existing = strings(&["2.3.1+20240101.abc", "2.3.0+20230101.def"]);
        assert_eq!(
            check_latest(&existing, "2.3", "").expect("latest"),
            Some("2.3.1+20240101.abc".to_string())
        );
    }

    proptest! {
        /// The allocated untagged version is strictly greater than every
        /// existing member of the line.
        #[test]
        fn untagged_next_is_strictly_greater(patches in proptest::collection::vec(0u64..200, 0..12)) {
            let existing: Vec<String> =
                patches.iter().map(|p| format!("2.3.{p}")).collect();
            let next = next_version(&existing, "2.3", "").expect("next");
            let next = Version::parse(&next).expect("parse next");
            for v in &existing {
                let v = Version::parse(v).expect("parse existing");
                prop_assert!(next > v);
            }
        }

        /// Allocation is deterministic in the set of existing versions,
        /// regardless of their order.
        #[test]
        fn allocation_is_order_insensitive(patches in proptest::collection::vec(0u64..50, 1..8)) {
            let forward: Vec<String> =
                patches.iter().map(|p| format!("1.0.{p}")).collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            prop_assert_eq!(
                next_version(&forward, "1.0", "").expect("next"),
                next_version(&reversed, "1.0", "").expect("next")
            );
        }
    }
}
