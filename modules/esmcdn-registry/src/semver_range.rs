//! npm-flavored range matching on top of the `semver` crate. npm separates
//! AND-comparators with spaces and alternatives with `||`; the semver crate
//! wants commas and has no alternation, so ranges are translated first.

use semver::{Version, VersionReq};

/// One alternative of an npm range, parsed if the syntax is expressible.
fn parse_alternative(alt: &str) -> Option<VersionReq> {
    let alt = alt.trim();
    if alt.is_empty() || alt == "*" || alt == "latest" {
        return VersionReq::parse("*").ok();
    }
    // npm hyphen ranges (`1.2.3 - 2.0.0`) become a >=/<= pair.
    if let Some((lo, hi)) = alt.split_once(" - ") {
        return VersionReq::parse(&format!(">={}, <={}", lo.trim(), hi.trim())).ok();
    }
    let joined = alt.split_whitespace().collect::<Vec<_>>().join(", ");
    VersionReq::parse(&joined).ok()
}

/// Does `version` satisfy the npm-style `range`?
pub fn range_matches(range: &str, version: &Version) -> bool {
    range
        .split("||")
        .filter_map(parse_alternative)
        .any(|req| req.matches(version))
}

/// Pick the highest version in `candidates` satisfying `range`. Prerelease
/// versions are only considered when the range itself mentions a prerelease.
pub fn max_satisfying<'a, I>(range: &str, candidates: I) -> Option<Version>
where
    I: IntoIterator<Item = &'a str>,
{
    let allow_prerelease = range.contains('-');
    let mut best: Option<Version> = None;
    for raw in candidates {
        let Ok(version) = Version::parse(raw) else {
            continue;
        };
        if !version.pre.is_empty() && !allow_prerelease {
            continue;
        }
        if !range_matches(range, &version) {
            continue;
        }
        if best.as_ref().map(|b| version > *b).unwrap_or(true) {
            best = Some(version);
        }
    }
    best
}
