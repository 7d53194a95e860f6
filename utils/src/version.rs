use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;

/// The structural version of the resources managed for a cluster.
/// It is stored in an annotation on the cluster, e.g. `"300"`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    /// Create a schema version
    #[inline]
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// The raw number
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns true if a cluster annotated with `annotation` must be upgraded to `self`.
    /// A missing or unparsable annotation always requires the upgrade.
    #[inline]
    #[must_use]
    pub fn is_newer_than_annotation(self, annotation: Option<&str>) -> bool {
        annotation
            .and_then(|value| value.parse::<Self>().ok())
            .map_or(true, |current| current < self)
    }
}

impl FromStr for SchemaVersion {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|err| anyhow!("invalid schema version {s:?}: {err}"))
    }
}

impl Display for SchemaVersion {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for SchemaVersion {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_display() {
        let ver: SchemaVersion = "300".parse().unwrap();
        assert_eq!(ver, SchemaVersion::new(300));
        assert_eq!(ver.to_string(), "300");
        assert!(" 42 ".parse::<SchemaVersion>().is_ok());
        assert!("v3".parse::<SchemaVersion>().is_err());
        assert!("".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn upgrade_required() {
        let target = SchemaVersion::new(300);
        assert!(target.is_newer_than_annotation(None));
        assert!(target.is_newer_than_annotation(Some("garbage")));
        assert!(target.is_newer_than_annotation(Some("200")));
        assert!(!target.is_newer_than_annotation(Some("300")));
        assert!(!target.is_newer_than_annotation(Some("301")));
    }
}
