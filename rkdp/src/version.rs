use std::fmt;

/// Version information stamped in at build time.
///
/// The tag, commit and build date come from `RKDP_GIT_TAG`, `RKDP_GIT_COMMIT`
/// and `RKDP_BUILD_DATE`; without a tag the package version is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub release: String,
    pub git: String,
    pub build_date: String,
}

impl Version {
    pub fn current() -> Self {
        let tag = option_env!("RKDP_GIT_TAG").unwrap_or(env!("CARGO_PKG_VERSION"));
        Version::parse(
            tag,
            option_env!("RKDP_GIT_COMMIT").unwrap_or_default(),
            option_env!("RKDP_BUILD_DATE").unwrap_or_default(),
        )
    }

    /// Parse a `v1.2.3-rc1` style tag. Missing or non-numeric parts become 0.
    pub fn parse(tag: &str, git: &str, build_date: &str) -> Self {
        let tag = tag.strip_prefix('v').unwrap_or(tag);
        let (numbers, release) = match tag.split_once('-') {
            Some((numbers, release)) => (numbers, release.split('-').next().unwrap_or_default()),
            None => (tag, ""),
        };
        let mut parts = numbers.split('.').map(|p| p.parse().unwrap_or(0));

        Version {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            release: release.to_string(),
            git: git.to_string(),
            build_date: build_date.to_string(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.release.is_empty() {
            write!(f, "-{}", self.release)?;
        }
        write!(f, ", date:{}", self.build_date)
    }
}
