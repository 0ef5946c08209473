//! Kubernetes server version validation

/// Whether `version` is a semantic version as reported in `gitVersion`
///
/// Accepts `vMAJOR.MINOR.PATCH` with optional `-prerelease` and `+build`
/// suffixes. Numeric parts must not carry leading zeros.
pub fn is_valid_semver(version: &str) -> bool {
    let Some(rest) = version.strip_prefix('v') else {
        return false;
    };
    let (rest, build) = match rest.split_once('+') {
        Some((r, b)) => (r, Some(b)),
        None => (rest, None),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((c, p)) => (c, Some(p)),
        None => (rest, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 || !parts.iter().all(|p| is_numeric_identifier(p)) {
        return false;
    }
    if let Some(pre) = pre {
        if !pre.split('.').all(|id| {
            is_identifier(id) && (!id.bytes().all(|b| b.is_ascii_digit()) || is_numeric_identifier(id))
        }) {
            return false;
        }
    }
    build.map_or(true, |b| b.split('.').all(is_identifier))
}

fn is_numeric_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_release_and_distribution_versions() {
        assert!(is_valid_semver("v1.31.2"));
        assert!(is_valid_semver("v1.27.6+k3s1"));
        assert!(is_valid_semver("v1.29.0-eks-5e0fdde"));
        assert!(is_valid_semver("v1.28.3-gke.1286000"));
        assert!(is_valid_semver("v0.0.0"));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!(!is_valid_semver("1.31.2"));
        assert!(!is_valid_semver("v1.31"));
        assert!(!is_valid_semver("v1.031.2"));
        assert!(!is_valid_semver("v1.31.2-"));
        assert!(!is_valid_semver("v1.31.2+"));
        assert!(!is_valid_semver("v1.31.2-01"));
        assert!(!is_valid_semver(""));
    }
}
