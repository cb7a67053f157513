//! BinderHub image naming.
//!
//! BinderHub turns a `owner/repo` source name into a registry-safe image
//! name by escaping separator characters:
//!
//! | char | escape |
//! |------|--------|
//! | `-`  | `-2d`  |
//! | `_`  | `-5f`  |
//! | `/`  | `-2d`  |
//!
//! The result is lower-cased and prefixed with the image prefix
//! (`binder-` by default) and an optional project namespace.

use regex::Regex;

/// Escape sequences produced by [`encode_repo_name`]. A `-` that already
/// starts one of these is copied through untouched, so encoding an encoded
/// name is a no-op.
const ESCAPES: [&str; 2] = ["2d", "5f"];

/// Encode a source name following the BinderHub convention.
///
/// ```
/// use rees_build::naming::encode_repo_name;
/// assert_eq!(encode_repo_name("user/my-repo"), "user-2dmy-2drepo");
/// assert_eq!(encode_repo_name("user-2dmy-2drepo"), "user-2dmy-2drepo");
/// ```
pub fn encode_repo_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut encoded = String::with_capacity(lower.len() * 2);
    let mut rest = lower.as_str();

    while let Some(ch) = rest.chars().next() {
        let after = &rest[ch.len_utf8()..];
        match ch {
            '-' if ESCAPES.iter().any(|esc| after.starts_with(esc)) => {
                encoded.push_str(&rest[..3]);
                rest = &rest[3..];
                continue;
            }
            '-' | '/' => encoded.push_str("-2d"),
            '_' => encoded.push_str("-5f"),
            other => encoded.push(other),
        }
        rest = after;
    }

    encoded
}

/// Build the full image name: `[namespace/]<prefix><encoded>`.
pub fn build_image_name(source_name: &str, prefix: &str, namespace: Option<&str>) -> String {
    let image_name = format!("{}{}", prefix, encode_repo_name(source_name));
    match namespace.filter(|ns| !ns.trim().is_empty()) {
        Some(ns) => format!("{}/{}", ns.trim_end_matches('/'), image_name),
        None => image_name,
    }
}

/// Build an anchored prefix pattern matching catalog entries for `source_name`.
pub fn build_search_pattern(
    source_name: &str,
    prefix: &str,
    namespace: Option<&str>,
) -> Result<Regex, regex::Error> {
    let base = build_image_name(source_name, prefix, namespace);
    Regex::new(&format!("^{}", regex::escape(&base)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_basic() {
        assert_eq!(encode_repo_name("user/repo"), "user-2drepo");
        assert_eq!(encode_repo_name("user/my_repo"), "user-2dmy-5frepo");
        assert_eq!(encode_repo_name("User/Repo-X"), "user-2drepo-2dx");
    }

    #[test]
    fn test_encode_is_idempotent() {
        for name in ["user/repo", "a-b_c/d-e", "QC-imaging/demo_graphics", "x/y"] {
            let once = encode_repo_name(name);
            assert_eq!(encode_repo_name(&once), once, "re-encoding {}", name);
        }
    }

    #[test]
    fn test_encode_literal_escape_lookalikes() {
        // Bare digit sequences resembling escape codes are not separators.
        let once = encode_repo_name("user2d/repo5f");
        assert_eq!(once, "user2d-2drepo5f");
        assert_eq!(encode_repo_name(&once), once);

        let once = encode_repo_name("lab_2d/tool-5f");
        assert_eq!(once, "lab-5f2d-2dtool-5f");
        assert_eq!(encode_repo_name(&once), once);
    }

    #[test]
    fn test_encode_trailing_dash() {
        assert_eq!(encode_repo_name("user/repo-"), "user-2drepo-2d");
    }

    #[test]
    fn test_build_image_name() {
        assert_eq!(
            build_image_name("user/repo", "binder-", None),
            "binder-user-2drepo"
        );
        assert_eq!(
            build_image_name("user/repo", "binder-", Some("myproject")),
            "myproject/binder-user-2drepo"
        );
        assert_eq!(
            build_image_name("user/repo", "binder-", Some("  ")),
            "binder-user-2drepo"
        );
    }

    #[test]
    fn test_search_pattern_is_anchored_prefix() {
        let pattern = build_search_pattern("user/repo", "binder-", None).unwrap();
        assert!(pattern.is_match("binder-user-2drepo"));
        assert!(pattern.is_match("binder-user-2drepo-abc123"));
        assert!(!pattern.is_match("other/binder-user-2drepo"));
        assert!(!pattern.is_match("binder-user-2drep"));
    }

    #[test]
    fn test_search_pattern_escapes_regex_metacharacters() {
        let pattern = build_search_pattern("user/repo.js", "binder-", None).unwrap();
        assert!(pattern.is_match("binder-user-2drepo.js"));
        assert!(!pattern.is_match("binder-user-2drepoxjs"));
    }
}
