use crate::types::Target;

/// Infer a build target from a `User-Agent` header.
///
/// The table is the single externally visible point of non-determinism in the
/// pipeline: requests without an explicit target segment get their target from
/// here (and the response carries `Vary: User-Agent`). Unknown agents fall
/// back to the weakest target.
pub fn target_from_user_agent(ua: &str) -> Target {
    if ua.is_empty() {
        return Target::Es2015;
    }

    if let Some(version) = version_after(ua, "Deno/") {
        // The `denonext` ABI landed in Deno 1.33.2.
        return if version_at_least(&version, 1, 33, 2) {
            Target::DenoNext
        } else {
            Target::Deno
        };
    }

    if ua.contains("Node/") || ua.contains("Node.js/") || ua.starts_with("undici") {
        return Target::Node;
    }
    if ua.starts_with("Bun/") || ua.contains(" Bun/") {
        return Target::Node;
    }

    if let Some(v) = version_after(ua, "Firefox/") {
        return match major(&v) {
            n if n >= 93 => Target::Es2022,
            n if n >= 80 => Target::Es2020,
            n if n >= 55 => Target::Es2017,
            _ => Target::Es2015,
        };
    }

    // Chrome, Edge, headless Chrome and other Chromium shells.
    let chrome = version_after(ua, "Chrome/")
        .or_else(|| version_after(ua, "Chromium/"))
        .or_else(|| version_after(ua, "HeadlessChrome/"));
    if let Some(v) = chrome {
        return match major(&v) {
            n if n >= 94 => Target::Es2022,
            n if n >= 80 => Target::Es2020,
            n if n >= 63 => Target::Es2018,
            n if n >= 55 => Target::Es2017,
            _ => Target::Es2015,
        };
    }

    // Safari reports its own version in `Version/` before `Safari/`.
    if ua.contains("Safari/") {
        if let Some(v) = version_after(ua, "Version/") {
            return match major(&v) {
                n if n >= 15 => Target::Es2021,
                n if n >= 14 => Target::Es2020,
                n if n >= 11 => Target::Es2017,
                _ => Target::Es2015,
            };
        }
    }

    Target::Es2015
}

fn version_after(ua: &str, marker: &str) -> Option<String> {
    let start = ua.find(marker)? + marker.len();
    let rest = &ua[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

fn major(version: &str) -> u32 {
    version.split('.').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn version_at_least(version: &str, maj: u32, min: u32, patch: u32) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let v = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    v >= (maj, min, patch)
}
