//! Space and security classification, derived from system IDs and security
//! scores. The boundaries are ID-range heuristics inherited from the
//! upstream universe layout; they are data, kept here in one place.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use strum::{Display, EnumString};

/// Known space runs in this band of system IDs.
const KNOWN_SPACE_SYSTEMS: RangeInclusive<i64> = 30_000_000..=30_999_999;

/// J-space (wormhole) systems occupy their own band.
const WORMHOLE_SYSTEMS: RangeInclusive<i64> = 31_000_000..=31_999_999;

/// The systems carved out of known space into Pochven. Hand-maintained; the
/// region is closed, so this list does not grow.
const POCHVEN_SYSTEMS: &[i64] = &[
    30_000_021, 30_000_157, 30_000_192, 30_001_372, 30_001_381, 30_001_413,
    30_001_445, 30_002_079, 30_002_411, 30_002_652, 30_002_702, 30_002_737,
    30_002_770, 30_002_797, 30_003_046, 30_003_504, 30_003_535, 30_005_005,
    30_010_141, 30_031_392, 30_040_141, 30_045_328, 30_045_329, 30_045_331,
    30_045_332, 30_045_338, 30_045_339,
];

const HIGHSEC_FLOOR: f64 = 0.45;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SpaceClass {
    Normal,
    Wormhole,
    Pochven,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SecurityClass {
    Highsec,
    Lowsec,
    Nullsec,
    Wormhole,
    Pochven,
}

impl SpaceClass {
    pub fn of_system(system_id: i64) -> SpaceClass {
        if WORMHOLE_SYSTEMS.contains(&system_id) {
            SpaceClass::Wormhole
        } else if POCHVEN_SYSTEMS.contains(&system_id) {
            SpaceClass::Pochven
        } else {
            SpaceClass::Normal
        }
    }

    /// True for IDs that belong to any mapped band at all. Events from
    /// outside these bands still classify as normal space; this exists for
    /// diagnostics.
    pub fn is_mapped_system(system_id: i64) -> bool {
        KNOWN_SPACE_SYSTEMS.contains(&system_id) || WORMHOLE_SYSTEMS.contains(&system_id)
    }
}

impl SecurityClass {
    /// Classify a system given its security score where one is known.
    /// Wormhole and Pochven systems have a fixed class regardless of score;
    /// for the rest, an unknown score classifies as nullsec.
    pub fn derive(system_id: i64, security_status: Option<f64>) -> SecurityClass {
        match SpaceClass::of_system(system_id) {
            SpaceClass::Wormhole => SecurityClass::Wormhole,
            SpaceClass::Pochven => SecurityClass::Pochven,
            SpaceClass::Normal => match security_status {
                Some(score) if score >= HIGHSEC_FLOOR => SecurityClass::Highsec,
                Some(score) if score > 0.0 => SecurityClass::Lowsec,
                _ => SecurityClass::Nullsec,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn wormhole_band_classifies_as_wormhole() {
        assert_eq!(SpaceClass::of_system(31_000_005), SpaceClass::Wormhole);
        assert_eq!(
            SecurityClass::derive(31_000_005, Some(0.9)),
            SecurityClass::Wormhole
        );
    }

    #[test]
    fn pochven_systems_classify_as_pochven() {
        assert_eq!(SpaceClass::of_system(30_003_504), SpaceClass::Pochven);
        assert_eq!(
            SecurityClass::derive(30_003_504, Some(0.8)),
            SecurityClass::Pochven
        );
    }

    #[test]
    fn known_space_classifies_by_security_score() {
        assert_eq!(SpaceClass::of_system(30_000_142), SpaceClass::Normal);
        assert_eq!(
            SecurityClass::derive(30_000_142, Some(0.946)),
            SecurityClass::Highsec
        );
        assert_eq!(
            SecurityClass::derive(30_000_142, Some(0.45)),
            SecurityClass::Highsec
        );
        assert_eq!(
            SecurityClass::derive(30_000_142, Some(0.3)),
            SecurityClass::Lowsec
        );
        assert_eq!(
            SecurityClass::derive(30_000_142, Some(0.0)),
            SecurityClass::Nullsec
        );
        assert_eq!(
            SecurityClass::derive(30_000_142, Some(-0.2)),
            SecurityClass::Nullsec
        );
    }

    #[test]
    fn unknown_score_falls_back_to_nullsec() {
        assert_eq!(
            SecurityClass::derive(30_000_142, None),
            SecurityClass::Nullsec
        );
    }

    #[test]
    fn classes_round_trip_through_strings() {
        for class in [
            SecurityClass::Highsec,
            SecurityClass::Lowsec,
            SecurityClass::Nullsec,
            SecurityClass::Wormhole,
            SecurityClass::Pochven,
        ] {
            assert_eq!(
                SecurityClass::from_str(&class.to_string()).unwrap(),
                class
            );
        }
        for class in [SpaceClass::Normal, SpaceClass::Wormhole, SpaceClass::Pochven] {
            assert_eq!(SpaceClass::from_str(&class.to_string()).unwrap(), class);
        }
    }
}
