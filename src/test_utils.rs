//! Test utilities for property-based testing
//!
//! This module provides generators and helpers for proptest.

#[cfg(test)]
pub mod generators {
    use proptest::prelude::*;

    /// Generate a valid package name (lowercase alphanumeric with `+.-`)
    pub fn package_name() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9+.-]{0,30}"
    }

    /// Generate an upstream version such as `1.2.3` or `2024.01`
    pub fn upstream_version() -> impl Strategy<Value = String> {
        proptest::collection::vec(0u32..1000, 1..4).prop_map(|parts| {
            parts
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(".")
        })
    }

    /// Generate a valid SHA256 hash (64 hex characters)
    pub fn sha256_hash() -> impl Strategy<Value = String> {
        "[0-9a-f]{64}"
    }

    /// Generate a tarball URL
    pub fn tarball_url() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("https"), Just("http")],
            "[a-z]{3,10}",
            "[a-z]{2,5}",
            "[a-z0-9-]{1,20}",
            prop_oneof![
                Just(".tar.gz"),
                Just(".tar.xz"),
                Just(".tar.bz2"),
                Just(".tar.zst"),
                Just(".tgz"),
                Just(".zip"),
            ],
        )
            .prop_map(|(scheme, domain, tld, path, ext)| {
                format!("{scheme}://{domain}.{tld}/{path}{ext}")
            })
    }

    /// Generate a build architecture
    pub fn arch() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("amd64".to_string()),
            Just("arm64".to_string()),
            Just("loongarch64".to_string()),
            Just("ppc64el".to_string()),
            Just("riscv64".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use crate::core::parser::validate_package_name;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_package_name_generator(name in package_name()) {
            prop_assert!(validate_package_name(&name));
        }

        #[test]
        fn test_upstream_version_generator(version in upstream_version()) {
            for part in version.split('.') {
                prop_assert!(part.parse::<u32>().is_ok());
            }
        }

        #[test]
        fn test_sha256_hash_generator(hash in sha256_hash()) {
            prop_assert_eq!(hash.len(), 64);
            prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn test_tarball_url_generator(url in tarball_url()) {
            prop_assert!(url.starts_with("https://") || url.starts_with("http://"));
            prop_assert!(!url.chars().any(char::is_whitespace));
            let known = [".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst", ".tgz", ".zip"];
            prop_assert!(known.iter().any(|ext| url.ends_with(ext)), "unexpected url {}", url);
        }

        #[test]
        fn test_arch_generator(arch in arch()) {
            prop_assert!(arch.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }
}
