//! The process-wide tracking filter. There is exactly one ruleset row; every
//! ingester and feed instance holds a copy behind a [`RulesetHandle`] and
//! re-reads the store when the invalidation channel fires.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::{DbEvent, DbRuleset};
use crate::space::SecurityClass;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ruleset {
    pub min_pilots: i32,
    pub tracked_alliance_ids: Vec<i64>,
    pub tracked_corp_ids: Vec<i64>,
    pub tracked_system_ids: Vec<i64>,
    pub tracked_security_classes: Vec<SecurityClass>,
    pub ignore_unlisted: bool,
    pub updated_at: DateTime<Utc>,
}

/// A partial update to the singleton. Absent fields keep their current
/// value; last writer wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesetPatch {
    pub min_pilots: Option<i32>,
    pub tracked_alliance_ids: Option<Vec<i64>>,
    pub tracked_corp_ids: Option<Vec<i64>>,
    pub tracked_system_ids: Option<Vec<i64>>,
    pub tracked_security_classes: Option<Vec<SecurityClass>>,
    pub ignore_unlisted: Option<bool>,
}

/// The fields of an event the predicate looks at, borrowed from whichever
/// representation the caller has (a freshly normalized killmail or a stored
/// row).
#[derive(Debug, Clone, Copy)]
pub struct EventFacts<'a> {
    pub system_id: i64,
    pub security_class: SecurityClass,
    pub victim_character_id: Option<i64>,
    pub victim_corp_id: Option<i64>,
    pub victim_alliance_id: Option<i64>,
    pub attacker_character_ids: &'a [i64],
    pub attacker_corp_ids: &'a [i64],
    pub attacker_alliance_ids: &'a [i64],
}

impl<'a> EventFacts<'a> {
    /// Victim plus attackers with character identities, floored at one: an
    /// event always involves at least the victim even when the upstream
    /// record carries no character IDs at all.
    pub fn participant_count(&self) -> usize {
        let count = usize::from(self.victim_character_id.is_some())
            + self.attacker_character_ids.len();
        count.max(1)
    }
}

impl Ruleset {
    /// Whether any tracked list is populated at all. When none is, tracking
    /// flags have nothing to match against and every event passes.
    fn has_tracking(&self) -> bool {
        !(self.tracked_alliance_ids.is_empty()
            && self.tracked_corp_ids.is_empty()
            && self.tracked_system_ids.is_empty()
            && self.tracked_security_classes.is_empty())
    }

    /// An event matches tracking when its victim or any attacker is in a
    /// tracked alliance/corp list, or its system or security class is
    /// tracked. Any single match admits the event.
    fn matches_tracking(&self, facts: &EventFacts<'_>) -> bool {
        let alliance_tracked = facts
            .victim_alliance_id
            .is_some_and(|id| self.tracked_alliance_ids.contains(&id))
            || facts
                .attacker_alliance_ids
                .iter()
                .any(|id| self.tracked_alliance_ids.contains(id));

        let corp_tracked = facts
            .victim_corp_id
            .is_some_and(|id| self.tracked_corp_ids.contains(&id))
            || facts
                .attacker_corp_ids
                .iter()
                .any(|id| self.tracked_corp_ids.contains(id));

        alliance_tracked
            || corp_tracked
            || self.tracked_system_ids.contains(&facts.system_id)
            || self
                .tracked_security_classes
                .contains(&facts.security_class)
    }

    /// The coarse pre-ingest check: with `ignore_unlisted` set and tracking
    /// configured, untracked events are dropped before they are persisted.
    pub fn rejects_at_ingest(&self, facts: &EventFacts<'_>) -> bool {
        self.ignore_unlisted && self.has_tracking() && !self.matches_tracking(facts)
    }

    /// The full feed predicate: minimum pilot count, then tracking when
    /// either the ruleset or the request asks for tracked events only.
    pub fn admits(&self, facts: &EventFacts<'_>, tracked_only: bool) -> bool {
        if facts.participant_count() < self.min_pilots.max(0) as usize {
            return false;
        }

        if (tracked_only || self.ignore_unlisted) && self.has_tracking() {
            return self.matches_tracking(facts);
        }

        true
    }

    pub fn apply_patch(&mut self, patch: &RulesetPatch, updated_at: DateTime<Utc>) {
        if let Some(min_pilots) = patch.min_pilots {
            self.min_pilots = min_pilots;
        }
        if let Some(ids) = &patch.tracked_alliance_ids {
            self.tracked_alliance_ids = ids.clone();
        }
        if let Some(ids) = &patch.tracked_corp_ids {
            self.tracked_corp_ids = ids.clone();
        }
        if let Some(ids) = &patch.tracked_system_ids {
            self.tracked_system_ids = ids.clone();
        }
        if let Some(classes) = &patch.tracked_security_classes {
            self.tracked_security_classes = classes.clone();
        }
        if let Some(ignore_unlisted) = patch.ignore_unlisted {
            self.ignore_unlisted = ignore_unlisted;
        }
        self.updated_at = updated_at;
    }
}

impl From<DbRuleset> for Ruleset {
    fn from(row: DbRuleset) -> Self {
        let tracked_security_classes = row
            .tracked_security_classes
            .iter()
            .flatten()
            .filter_map(|name| match SecurityClass::from_str(name) {
                Ok(class) => Some(class),
                Err(_) => {
                    warn!("Ruleset row contains unknown security class {name:?}; ignoring it");
                    None
                }
            })
            .collect_vec();

        Ruleset {
            min_pilots: row.min_pilots,
            tracked_alliance_ids: row.tracked_alliance_ids.into_iter().flatten().collect(),
            tracked_corp_ids: row.tracked_corp_ids.into_iter().flatten().collect(),
            tracked_system_ids: row.tracked_system_ids.into_iter().flatten().collect(),
            tracked_security_classes,
            ignore_unlisted: row.ignore_unlisted,
            updated_at: row.updated_at.and_utc(),
        }
    }
}

impl DbEvent {
    /// Borrow the predicate-relevant fields of a stored event. The class
    /// column is authoritative; an unparseable value (which would take a
    /// manual edit of the row) classes as nullsec.
    pub fn facts<'a>(
        &'a self,
        attacker_characters: &'a [i64],
        attacker_corps: &'a [i64],
        attacker_alliances: &'a [i64],
    ) -> EventFacts<'a> {
        EventFacts {
            system_id: self.system_id,
            security_class: SecurityClass::from_str(&self.security_class)
                .unwrap_or(SecurityClass::Nullsec),
            victim_character_id: self.victim_character_id,
            victim_corp_id: self.victim_corp_id,
            victim_alliance_id: self.victim_alliance_id,
            attacker_character_ids: attacker_characters,
            attacker_corp_ids: attacker_corps,
            attacker_alliance_ids: attacker_alliances,
        }
    }
}

/// A shared, atomically replaceable copy of the active ruleset. Cheap to
/// clone; all clones observe replacements.
#[derive(Clone)]
pub struct RulesetHandle {
    inner: Arc<RwLock<Ruleset>>,
}

impl RulesetHandle {
    pub fn new(initial: Ruleset) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn current(&self) -> Ruleset {
        self.inner
            .read()
            .expect("ruleset lock should not be poisoned")
            .clone()
    }

    pub fn replace(&self, ruleset: Ruleset) {
        *self
            .inner
            .write()
            .expect("ruleset lock should not be poisoned") = ruleset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_ruleset() -> Ruleset {
        Ruleset {
            min_pilots: 1,
            tracked_alliance_ids: vec![],
            tracked_corp_ids: vec![],
            tracked_system_ids: vec![],
            tracked_security_classes: vec![],
            ignore_unlisted: false,
            updated_at: Utc::now(),
        }
    }

    fn facts<'a>(attackers: &'a [i64], attacker_alliances: &'a [i64]) -> EventFacts<'a> {
        EventFacts {
            system_id: 30000142,
            security_class: SecurityClass::Highsec,
            victim_character_id: Some(11),
            victim_corp_id: Some(21),
            victim_alliance_id: Some(31),
            attacker_character_ids: attackers,
            attacker_corp_ids: &[],
            attacker_alliance_ids: attacker_alliances,
        }
    }

    #[test]
    fn participant_count_floors_at_one() {
        let mut f = facts(&[], &[]);
        f.victim_character_id = None;
        assert_eq!(f.participant_count(), 1);
    }

    #[test]
    fn participant_count_is_victim_plus_attackers() {
        let f = facts(&[12, 13], &[]);
        assert_eq!(f.participant_count(), 3);
    }

    #[test]
    fn min_pilots_drops_small_events() {
        let mut ruleset = empty_ruleset();
        ruleset.min_pilots = 3;

        assert!(!ruleset.admits(&facts(&[12], &[]), false));
        assert!(ruleset.admits(&facts(&[12, 13], &[]), false));
    }

    #[test]
    fn empty_tracking_admits_everything() {
        let mut ruleset = empty_ruleset();
        ruleset.ignore_unlisted = true;

        assert!(ruleset.admits(&facts(&[12], &[]), true));
        assert!(!ruleset.rejects_at_ingest(&facts(&[12], &[])));
    }

    #[test]
    fn any_tracked_list_match_admits() {
        let mut ruleset = empty_ruleset();
        ruleset.ignore_unlisted = true;
        ruleset.tracked_alliance_ids = vec![32];

        // Victim alliance 31 is not tracked, but an attacker alliance is.
        assert!(ruleset.admits(&facts(&[12], &[32]), false));
        assert!(!ruleset.admits(&facts(&[12], &[33]), false));
    }

    #[test]
    fn tracked_system_admits_regardless_of_entities() {
        let mut ruleset = empty_ruleset();
        ruleset.ignore_unlisted = true;
        ruleset.tracked_system_ids = vec![30000142];

        assert!(ruleset.admits(&facts(&[], &[]), false));
    }

    #[test]
    fn tracked_security_class_admits() {
        let mut ruleset = empty_ruleset();
        ruleset.ignore_unlisted = true;
        ruleset.tracked_security_classes = vec![SecurityClass::Highsec];

        assert!(ruleset.admits(&facts(&[], &[]), false));

        ruleset.tracked_security_classes = vec![SecurityClass::Nullsec];
        assert!(!ruleset.admits(&facts(&[], &[]), false));
    }

    #[test]
    fn tracked_only_applies_tracking_even_without_ignore_unlisted() {
        let mut ruleset = empty_ruleset();
        ruleset.tracked_corp_ids = vec![99];

        assert!(ruleset.admits(&facts(&[], &[]), false));
        assert!(!ruleset.admits(&facts(&[], &[]), true));
    }

    #[test]
    fn ingest_rejection_only_applies_with_ignore_unlisted() {
        let mut ruleset = empty_ruleset();
        ruleset.tracked_corp_ids = vec![99];

        assert!(!ruleset.rejects_at_ingest(&facts(&[], &[])));

        ruleset.ignore_unlisted = true;
        assert!(ruleset.rejects_at_ingest(&facts(&[], &[])));
    }

    #[test]
    fn patch_replaces_only_present_fields() {
        let mut ruleset = empty_ruleset();
        ruleset.tracked_alliance_ids = vec![1, 2];
        let before = ruleset.clone();

        let now = Utc::now();
        ruleset.apply_patch(
            &RulesetPatch {
                min_pilots: Some(5),
                ..Default::default()
            },
            now,
        );

        assert_eq!(ruleset.min_pilots, 5);
        assert_eq!(ruleset.tracked_alliance_ids, before.tracked_alliance_ids);
        assert_eq!(ruleset.updated_at, now);
    }
}
