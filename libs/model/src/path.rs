//! Hierarchical machine paths.

use std::fmt;
use std::str::FromStr;

use crate::ModelError;

/// An absolute inventory path identifying one machine.
///
/// The path must have at least two segments: a datacenter and a machine name.
/// Segments are separated by `/` and may not be empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachinePath(String);

impl MachinePath {
    /// Parses a machine path from a string.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        if s.is_empty() {
            return Err(ModelError::EmptyPath);
        }

        let Some(rest) = s.strip_prefix('/') else {
            return Err(ModelError::RelativePath(s.to_string()));
        };

        let mut count = 0;
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(ModelError::EmptySegment(s.to_string()));
            }
            if let Some(ch) = segment
                .chars()
                .find(|c| c.is_control() || matches!(c, '[' | ']'))
            {
                return Err(ModelError::InvalidCharacter {
                    segment: segment.to_string(),
                    ch,
                });
            }
            count += 1;
        }

        if count < 2 {
            return Err(ModelError::TooShort(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the full path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the machine name (last segment).
    pub fn name(&self) -> &str {
        // parse() guarantees at least two non-empty segments
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Returns the datacenter (first segment).
    pub fn datacenter(&self) -> &str {
        self.0[1..].split('/').next().unwrap_or_default()
    }

    /// Returns the inventory folder holding the machine, e.g. `/opdx1/vm/eng`.
    pub fn folder(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) if idx > 0 => &self.0[..idx],
            _ => "/",
        }
    }
}

impl fmt::Display for MachinePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachinePath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for MachinePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for MachinePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for MachinePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_components() {
        let path = MachinePath::parse("/opdx1/vm/eng/CLOUD-0a1b2c3d").unwrap();
        assert_eq!(path.name(), "CLOUD-0a1b2c3d");
        assert_eq!(path.datacenter(), "opdx1");
        assert_eq!(path.folder(), "/opdx1/vm/eng");
    }

    #[test]
    fn test_two_segment_path() {
        let path = MachinePath::parse("/dc/web01").unwrap();
        assert_eq!(path.name(), "web01");
        assert_eq!(path.datacenter(), "dc");
        assert_eq!(path.folder(), "/dc");
    }

    #[test]
    fn test_rejects_bad_paths() {
        assert_eq!(MachinePath::parse(""), Err(ModelError::EmptyPath));
        assert!(matches!(
            MachinePath::parse("dc/vm/x"),
            Err(ModelError::RelativePath(_))
        ));
        assert!(matches!(
            MachinePath::parse("/dc//x"),
            Err(ModelError::EmptySegment(_))
        ));
        assert!(matches!(
            MachinePath::parse("/dc/vm/"),
            Err(ModelError::EmptySegment(_))
        ));
        assert!(matches!(
            MachinePath::parse("/dc"),
            Err(ModelError::TooShort(_))
        ));
        assert!(matches!(
            MachinePath::parse("/dc/vm/[ds1] x"),
            Err(ModelError::InvalidCharacter { ch: '[', .. })
        ));
    }

    #[test]
    fn test_serde_validates() {
        let path: MachinePath = serde_json::from_str("\"/dc/vm/a\"").unwrap();
        assert_eq!(path.as_str(), "/dc/vm/a");
        assert!(serde_json::from_str::<MachinePath>("\"relative\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_paths_roundtrip(segments in prop::collection::vec("[A-Za-z0-9_.-]{1,12}", 2..6)) {
            let raw = format!("/{}", segments.join("/"));
            let path = MachinePath::parse(&raw).unwrap();
            prop_assert_eq!(path.to_string(), raw);
            prop_assert_eq!(path.name(), segments.last().unwrap().as_str());
            prop_assert_eq!(path.datacenter(), segments[0].as_str());
        }
    }
}
