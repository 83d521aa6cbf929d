//! Supported fiducial dictionaries.
//!
//! Dictionaries are a closed set: a name is parsed once (command line, JSON
//! config, detection sidecar) and every later stage works with the typed id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a dictionary name is not one of the supported ids.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown marker dictionary `{0}`")]
pub struct UnknownDictionary(pub String);

macro_rules! dictionaries {
    ($($variant:ident => ($name:literal, $codes:literal)),+ $(,)?) => {
        /// Predefined ArUco / AprilTag dictionary.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum DictionaryId {
            $($variant,)+
        }

        impl DictionaryId {
            /// Every supported dictionary, in declaration order.
            pub const ALL: &'static [DictionaryId] = &[$(DictionaryId::$variant,)+];

            /// OpenCV-style name, e.g. `DICT_6X6_250`.
            pub fn name(self) -> &'static str {
                match self {
                    $(DictionaryId::$variant => $name,)+
                }
            }

            /// Number of distinct marker ids the dictionary provides.
            pub fn code_count(self) -> usize {
                match self {
                    $(DictionaryId::$variant => $codes,)+
                }
            }
        }
    };
}

dictionaries! {
    Dict4x4_50 => ("DICT_4X4_50", 50),
    Dict4x4_100 => ("DICT_4X4_100", 100),
    Dict4x4_250 => ("DICT_4X4_250", 250),
    Dict4x4_1000 => ("DICT_4X4_1000", 1000),
    Dict5x5_50 => ("DICT_5X5_50", 50),
    Dict5x5_100 => ("DICT_5X5_100", 100),
    Dict5x5_250 => ("DICT_5X5_250", 250),
    Dict5x5_1000 => ("DICT_5X5_1000", 1000),
    Dict6x6_50 => ("DICT_6X6_50", 50),
    Dict6x6_100 => ("DICT_6X6_100", 100),
    Dict6x6_250 => ("DICT_6X6_250", 250),
    Dict6x6_1000 => ("DICT_6X6_1000", 1000),
    Dict7x7_50 => ("DICT_7X7_50", 50),
    Dict7x7_100 => ("DICT_7X7_100", 100),
    Dict7x7_250 => ("DICT_7X7_250", 250),
    Dict7x7_1000 => ("DICT_7X7_1000", 1000),
    ArucoOriginal => ("DICT_ARUCO_ORIGINAL", 1024),
    AprilTag16h5 => ("DICT_APRILTAG_16h5", 30),
    AprilTag25h9 => ("DICT_APRILTAG_25h9", 35),
    AprilTag36h10 => ("DICT_APRILTAG_36h10", 2320),
    AprilTag36h11 => ("DICT_APRILTAG_36h11", 587),
}

impl Default for DictionaryId {
    fn default() -> Self {
        DictionaryId::Dict6x6_250
    }
}

impl fmt::Display for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DictionaryId {
    type Err = UnknownDictionary;

    /// Accepts the OpenCV constant name with or without the `DICT_` prefix,
    /// case-insensitively (`DICT_6X6_250`, `6x6_250`, `dict_apriltag_36h11`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        let wanted = wanted.strip_prefix("DICT_").unwrap_or(&wanted);
        DictionaryId::ALL
            .iter()
            .copied()
            .find(|id| id.name()["DICT_".len()..].eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownDictionary(s.to_string()))
    }
}

impl TryFrom<String> for DictionaryId {
    type Error = UnknownDictionary;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DictionaryId> for String {
    fn from(value: DictionaryId) -> Self {
        value.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_opencv_names_and_short_forms() {
        assert_eq!(
            "DICT_6X6_250".parse::<DictionaryId>().unwrap(),
            DictionaryId::Dict6x6_250
        );
        assert_eq!(
            "4x4_50".parse::<DictionaryId>().unwrap(),
            DictionaryId::Dict4x4_50
        );
        assert_eq!(
            "dict_apriltag_36h11".parse::<DictionaryId>().unwrap(),
            DictionaryId::AprilTag36h11
        );
    }

    #[test]
    fn rejects_unknown_names() {
        let err = "DICT_9X9_1".parse::<DictionaryId>().unwrap_err();
        assert_eq!(err, UnknownDictionary("DICT_9X9_1".into()));
    }

    #[test]
    fn names_round_trip_through_serde() {
        for &id in DictionaryId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.name()));
            let back: DictionaryId = serde_json::from_str(&json).unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn serde_rejects_unknown_dictionary() {
        assert!(serde_json::from_str::<DictionaryId>("\"DICT_FOO\"").is_err());
    }
}
