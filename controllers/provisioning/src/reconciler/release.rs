//! Release version checks between a template and its cluster image set.

use semver::Version;

/// Architecture suffixes appended to release image tags
const ARCH_SUFFIXES: &[&str] = &["-x86_64", "-aarch64", "-arm64", "-ppc64le", "-s390x", "-multi"];

/// Extract the semantic version from a release image reference.
///
/// `quay.io/openshift-release-dev/ocp-release:4.17.0-x86_64` yields `4.17.0`.
/// Returns `None` when the tag is missing or not a full `x.y.z` version.
pub fn extract_release_version(image: &str) -> Option<Version> {
    let last_segment = image.rsplit('/').next()?;
    let (_, tag) = last_segment.rsplit_once(':')?;

    let mut tag = tag;
    for suffix in ARCH_SUFFIXES {
        if let Some(stripped) = tag.strip_suffix(suffix) {
            tag = stripped;
            break;
        }
    }
    if let Some(index) = tag.find("-build") {
        tag = &tag[..index];
    }

    let version = Version::parse(tag).ok()?;
    version.build.is_empty().then_some(version)
}

/// Check that the image set version equals the template release exactly,
/// pre-release tags included.
pub fn check_release_matches(
    image_set: &str,
    release_image: &str,
    template_release: &str,
) -> Result<(), String> {
    let image_version = extract_release_version(release_image).ok_or_else(|| {
        format!(
            "could not extract version from ClusterImageSet {image_set} releaseImage {release_image}"
        )
    })?;
    let release = Version::parse(template_release.trim()).map_err(|e| {
        format!("failed to parse ClusterTemplate release version {template_release}: {e}")
    })?;
    if image_version != release {
        return Err(format!(
            "the ClusterImageSet {image_set} version {image_version} does not match the ClusterTemplate release version {release}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_of(image: &str) -> String {
        extract_release_version(image)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_extract_release_version() {
        let repo = "quay.io/openshift-release-dev/ocp-release";
        assert_eq!(version_of(&format!("{repo}:4.17.0-x86_64")), "4.17.0");
        assert_eq!(version_of(&format!("{repo}:4.16.1")), "4.16.1");
        assert_eq!(version_of(&format!("{repo}:4.15.2-rc1")), "4.15.2-rc1");
        assert_eq!(version_of(&format!("{repo}:4.18.0-build.123")), "4.18.0");
        assert_eq!(version_of(&format!("{repo}:4.16.3-aarch64")), "4.16.3");
        assert_eq!(version_of(&format!("{repo}:4.17.0-rc1-x86_64")), "4.17.0-rc1");
    }

    #[test]
    fn test_extract_release_version_rejects_incomplete_tags() {
        assert_eq!(version_of("quay.io/openshift-release-dev/ocp-release"), "");
        assert_eq!(version_of("quay.io/openshift-release-dev/ocp-release:latest"), "");
        assert_eq!(version_of("quay.io/openshift-release-dev/ocp-release:4.17"), "");
        assert_eq!(version_of("registry.local:5000/ocp-release"), "");
        assert_eq!(version_of(""), "");
        assert_eq!(version_of("not-a-valid-image"), "");
    }

    #[test]
    fn test_release_match_is_exact() {
        let image = "quay.io/openshift-release-dev/ocp-release:4.15.2-rc1-x86_64";
        assert!(check_release_matches("img-4.15", image, "4.15.2-rc1").is_ok());

        let err = check_release_matches("img-4.15", image, "4.15.2").unwrap_err();
        assert!(err.contains("does not match"), "{err}");

        let err = check_release_matches("img-4.15", image, "four").unwrap_err();
        assert!(err.contains("failed to parse ClusterTemplate release version"), "{err}");
    }
}
