//! Dosing schedule and the matcher that decides whether a medicine is due
//!
//! The schedule maps a normalised medicine name to the wall-clock minutes at
//! which it is administered. Matching is a pure function of the schedule, the
//! medicine named by an event and the current time of day.

use chrono::{NaiveTime, Timelike};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::error::{ScheduleError, SubscriberError};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Fold a medicine name for lookup: case-insensitive, accent-insensitive,
/// surrounding and repeated whitespace ignored.
pub fn normalize_medicine(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            word.nfd()
                .filter(|c| !is_combining_mark(*c))
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A dosing time of day with minute resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DoseTime(u16);

impl DoseTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour >= 24 || minute >= 60 {
            return Err(ScheduleError::InvalidTime(format!("{hour}:{minute}")));
        }
        Ok(Self((hour * 60 + minute) as u16))
    }

    const fn hm(hour: u16, minute: u16) -> Self {
        Self(hour * 60 + minute)
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.0 % 60)
    }

    /// Minutes between two times of day, measured the short way round midnight
    pub fn distance(&self, other: DoseTime) -> u16 {
        let forward = (self.0 + MINUTES_PER_DAY - other.0) % MINUTES_PER_DAY;
        forward.min(MINUTES_PER_DAY - forward)
    }
}

impl From<NaiveTime> for DoseTime {
    fn from(time: NaiveTime) -> Self {
        Self::hm(time.hour() as u16, time.minute() as u16)
    }
}

impl FromStr for DoseTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !(1..=2).contains(&hour.len()) || minute.len() != 2 || !digits(hour) || !digits(minute) {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        DoseTime::new(hour, minute).map_err(|_| invalid())
    }
}

impl fmt::Display for DoseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for DoseTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DoseTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One medicine and the times of day it is due
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledMedicine {
    /// Name as configured, used in reminders
    pub name: String,
    pub times: BTreeSet<DoseTime>,
}

impl ScheduledMedicine {
    pub fn reminder_message(&self) -> String {
        format!("The patient must take {}", self.name)
    }
}

/// Schedule file entries in document order, repeated keys included
struct ScheduleEntries(Vec<(String, Vec<DoseTime>)>);

impl<'de> Deserialize<'de> for ScheduleEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ScheduleEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of medicine names to lists of HH:MM times")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Vec<DoseTime>>()? {
                    entries.push(entry);
                }
                Ok(ScheduleEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Read-only mapping from medicine to dosing times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosingSchedule {
    medicines: HashMap<String, ScheduledMedicine>,
}

impl DosingSchedule {
    pub fn new<I, N, T>(entries: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: IntoIterator<Item = DoseTime>,
    {
        let mut medicines: HashMap<String, ScheduledMedicine> = HashMap::new();

        for (name, times) in entries {
            let name = name.into().trim().to_string();
            let key = normalize_medicine(&name);
            if key.is_empty() {
                return Err(ScheduleError::EmptyName);
            }

            let times: BTreeSet<DoseTime> = times.into_iter().collect();
            if times.is_empty() {
                return Err(ScheduleError::NoDoseTimes(name));
            }

            if let Some(existing) = medicines.get(&key) {
                return Err(ScheduleError::DuplicateMedicine {
                    first: existing.name.clone(),
                    second: name,
                });
            }

            medicines.insert(key, ScheduledMedicine { name, times });
        }

        Ok(Self { medicines })
    }

    /// Parse `{"medicine": ["HH:MM", ...], ...}`
    pub fn from_json(json: &str) -> Result<Self, ScheduleError> {
        let ScheduleEntries(entries) = serde_json::from_str(json)?;
        Self::new(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SubscriberError> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    /// The schedule the medicine timer shipped with
    pub fn builtin() -> Self {
        let entries = [
            ("paracetamol", vec![DoseTime::hm(0, 0), DoseTime::hm(8, 0), DoseTime::hm(16, 0)]),
            (
                "ibuprofeno",
                vec![
                    DoseTime::hm(0, 0),
                    DoseTime::hm(6, 0),
                    DoseTime::hm(12, 0),
                    DoseTime::hm(18, 0),
                ],
            ),
            ("insulina", vec![DoseTime::hm(8, 0), DoseTime::hm(20, 0)]),
            ("tolbutamina", vec![DoseTime::hm(18, 0)]),
        ];

        let medicines = entries
            .into_iter()
            .map(|(name, times)| {
                (
                    normalize_medicine(name),
                    ScheduledMedicine {
                        name: name.to_string(),
                        times: times.into_iter().collect(),
                    },
                )
            })
            .collect();

        Self { medicines }
    }

    pub fn get(&self, medicine: &str) -> Option<&ScheduledMedicine> {
        self.medicines.get(&normalize_medicine(medicine))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledMedicine> {
        self.medicines.values()
    }

    pub fn len(&self) -> usize {
        self.medicines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.medicines.is_empty()
    }
}

/// How far from a dosing time an event may be processed and still match.
///
/// `tolerance_minutes = 0` is exact-minute matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchPolicy {
    tolerance_minutes: u16,
}

impl MatchPolicy {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn window(tolerance_minutes: u32) -> Result<Self, ScheduleError> {
        if tolerance_minutes >= u32::from(MINUTES_PER_DAY / 2) {
            return Err(ScheduleError::InvalidTolerance(tolerance_minutes));
        }
        Ok(Self {
            tolerance_minutes: tolerance_minutes as u16,
        })
    }

    pub fn tolerance_minutes(&self) -> u16 {
        self.tolerance_minutes
    }

    pub fn covers(&self, dose: DoseTime, now: DoseTime) -> bool {
        dose.distance(now) <= self.tolerance_minutes
    }
}

/// Decides whether a medicine is due at a given time of day
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleMatcher {
    policy: MatchPolicy,
}

impl ScheduleMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn matches(&self, schedule: &DosingSchedule, medicine: &str, now: NaiveTime) -> bool {
        self.due_medicine(schedule, medicine, now).is_some()
    }

    /// The scheduled entry for `medicine` if one of its doses falls on `now`
    pub fn due_medicine<'a>(
        &self,
        schedule: &'a DosingSchedule,
        medicine: &str,
        now: NaiveTime,
    ) -> Option<&'a ScheduledMedicine> {
        let now = DoseTime::from(now);
        schedule
            .get(medicine)
            .filter(|scheduled| scheduled.times.iter().any(|dose| self.policy.covers(*dose, now)))
    }
}
