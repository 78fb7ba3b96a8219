use std::{env::consts, fmt, str::FromStr};

use crate::config::ConfigError;

/// Target platform of an image, with the names used by OCI (which are
/// the names from Go, like `amd64` or `arm64`).
///
/// # Examples
///
/// ```
/// # use undock::*;
/// let platform: Platform = "linux/arm/v7".parse().unwrap();
/// assert_eq!(platform.os, "linux");
/// assert_eq!(platform.architecture, "arm");
/// assert_eq!(platform.variant.as_deref(), Some("v7"));
/// assert_eq!(platform.dir_name(), "linux_armv7");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Platform {
    pub architecture: String,

    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "illumos", "ios", "linux", "netbsd",
    "openbsd", "plan9", "solaris", "windows",
];

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Platform {
            architecture: architecture.to_owned(),
            os: os.to_owned(),
            variant: variant.map(str::to_owned),
        }
    }

    /// Platform of the running process.
    pub fn host() -> Self {
        let os = match consts::OS {
            "macos" => "darwin",
            other => other,
        };

        let (architecture, variant) = normalize_arch(consts::ARCH, None);
        Platform {
            architecture,
            os: os.to_owned(),
            variant,
        }
    }

    /// Platform for index entries without a `platform` field.
    pub fn unknown() -> Self {
        Platform::new("unknown", "unknown", None)
    }

    /// Check if an entry for `self` can be used when `wanted` is requested.
    ///
    /// The variant is only compared if `wanted` has one. An `arm64`
    /// platform without variant is `v8`.
    pub fn satisfies(&self, wanted: &Platform) -> bool {
        let (arch, variant) = normalize_arch(&self.architecture, self.variant.as_deref());

        self.os == wanted.os
            && arch == wanted.architecture
            && (wanted.variant.is_none()
                || implied_variant(&arch, variant.as_deref())
                    == implied_variant(&wanted.architecture, wanted.variant.as_deref()))
    }

    /// Directory name for this platform, like `linux_arm64v8`.
    pub fn dir_name(&self) -> String {
        format!(
            "{}_{}{}",
            self.os,
            self.architecture,
            self.variant.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;

        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }

        Ok(())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    /// Parse `os/arch[/variant]`.
    ///
    /// A single component is read as the OS if it is a known one, and
    /// as the architecture (for `linux`) in any other case.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPlatform(spec.to_owned());

        let lower = spec.trim().to_ascii_lowercase();
        let parts: Vec<&str> = lower.split('/').collect();

        let valid_part = |p: &&str| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        };

        if !parts.iter().all(valid_part) {
            return Err(invalid());
        }

        let (os, arch, variant) = match parts.as_slice() {
            [single] if KNOWN_OS.contains(single) => {
                let host = Platform::host();
                (*single, host.architecture, host.variant)
            }

            [arch] => {
                let (arch, variant) = normalize_arch(arch, None);
                ("linux", arch, variant)
            }

            [os, arch] => {
                let (arch, variant) = normalize_arch(arch, None);
                (*os, arch, variant)
            }

            [os, arch, variant] => {
                let (arch, variant) = normalize_arch(arch, Some(variant));
                (*os, arch, variant)
            }

            _ => return Err(invalid()),
        };

        if !KNOWN_OS.contains(&os) {
            return Err(invalid());
        }

        Ok(Platform {
            architecture: arch,
            os: os.to_owned(),
            variant,
        })
    }
}

/// Translate architecture names to the Go names, and normalize the variant.
fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let (arch, variant) = match (arch, variant) {
        ("i386" | "x86", _) => ("386", None),
        ("x86_64" | "x86-64", _) => ("amd64", None),
        ("amd64", _) => ("amd64", variant),
        ("aarch64" | "arm64", Some("8" | "v8")) => ("arm64", Some("v8")),
        ("aarch64" | "arm64", v) => ("arm64", v),
        ("armhf", _) => ("arm", Some("v7")),
        ("armel", _) => ("arm", Some("v6")),
        ("arm", Some(v)) if v.len() == 1 => return ("arm".into(), Some(format!("v{v}"))),
        (other, v) => (other, v),
    };

    (arch.to_owned(), variant.map(str::to_owned))
}

/// Variant to compare, with the default for architectures that have one.
fn implied_variant<'a>(arch: &str, variant: Option<&'a str>) -> Option<&'a str> {
    match (arch, variant) {
        ("arm64", None) => Some("v8"),
        _ => variant,
    }
}

#[test]
fn parse_platforms() {
    macro_rules! check {
        ($spec:expr, $os:expr, $arch:expr, $variant:expr) => {
            assert_eq!(
                $spec.parse::<Platform>().unwrap(),
                Platform::new($os, $arch, $variant),
                "{}",
                $spec
            );
        };
    }

    check!("linux/amd64", "linux", "amd64", None);
    check!("linux/x86_64", "linux", "amd64", None);
    check!("Linux/AArch64", "linux", "arm64", None);
    check!("linux/arm64/8", "linux", "arm64", Some("v8"));
    check!("linux/arm/7", "linux", "arm", Some("v7"));
    check!("linux/armhf", "linux", "arm", Some("v7"));
    check!("windows/amd64", "windows", "amd64", None);
    check!("riscv64", "linux", "riscv64", None);

    for invalid in ["", "/", "linux/", "linux//v7", "foo/amd64", "linux/amd64/v1/x", "linux/a b"] {
        assert!(invalid.parse::<Platform>().is_err(), "{invalid:?}");
    }
}

#[test]
fn match_index_entries() {
    let arm64 = Platform::new("linux", "arm64", Some("v8"));
    let arm7 = Platform::new("linux", "arm", Some("v7"));

    assert!(arm64.satisfies(&"linux/arm64".parse().unwrap()));
    assert!(arm64.satisfies(&"linux/arm64/v8".parse().unwrap()));
    assert!(!arm64.satisfies(&"linux/amd64".parse().unwrap()));
    assert!(!arm7.satisfies(&"linux/arm/v6".parse().unwrap()));
    assert!(!arm7.satisfies(&"windows/arm".parse().unwrap()));

    // Index entries for arm64 usually omit the variant.
    let no_variant = Platform::new("linux", "arm64", None);
    assert!(no_variant.satisfies(&"linux/arm64/v8".parse().unwrap()));
    assert!(no_variant.satisfies(&"linux/arm64".parse().unwrap()));
    assert!(!no_variant.satisfies(&"linux/arm64/v9".parse().unwrap()));
    assert!(!Platform::new("linux", "arm", None).satisfies(&"linux/arm/v7".parse().unwrap()));
}

#[test]
fn format_platforms() {
    let platform = Platform::new("linux", "arm64", Some("v8"));
    assert_eq!(platform.to_string(), "linux/arm64/v8");
    assert_eq!(platform.dir_name(), "linux_arm64v8");

    let platform = Platform::new("linux", "amd64", None);
    assert_eq!(platform.to_string(), "linux/amd64");
    assert_eq!(platform.dir_name(), "linux_amd64");
}
