use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status of a condition
#[allow(clippy::exhaustive_enums)] // mirrors the kubernetes condition status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The state is not known
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Convert a boolean observation into a status
    #[inline]
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// A typed, timestamped condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    /// The condition type
    #[serde(rename = "type")]
    pub type_: T,
    /// The condition status
    pub status: ConditionStatus,
    /// The last time the status changed
    pub last_transition_time: Time,
    /// Machine readable reason of the last update
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message of the last update
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Ordered list of conditions, at most one per type.
///
/// Entries are appended the first time a type is set and updated in place
/// afterwards, so the serialized order is the insertion order.
#[derive(Clone, Debug)]
pub struct Conditions<T> {
    /// Conditions in insertion order
    items: Vec<Condition<T>>,
    /// Position of each type in `items`
    index: BTreeMap<T, usize>,
}

impl<T> Default for Conditions<T> {
    #[inline]
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<T: PartialEq> PartialEq for Conditions<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Copy + Ord + Debug> Conditions<T> {
    /// Returns the condition of the given type
    #[inline]
    #[must_use]
    pub fn get(&self, type_: T) -> Option<&Condition<T>> {
        self.index
            .get(&type_)
            .and_then(|&position| self.items.get(position))
    }

    /// Returns the status of the given type, if it is set
    #[inline]
    #[must_use]
    pub fn status(&self, type_: T) -> Option<ConditionStatus> {
        self.get(type_).map(|cond| cond.status)
    }

    /// Returns true if the condition is set to `True`
    #[inline]
    #[must_use]
    pub fn is_true(&self, type_: T) -> bool {
        matches!(self.status(type_), Some(ConditionStatus::True))
    }

    /// Iterate over the conditions in insertion order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Condition<T>> {
        self.items.iter()
    }

    /// Number of conditions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no condition was ever set
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Set a condition.
    /// `last_transition_time` moves to `now` only when the status differs from
    /// the stored one. Returns true if the status changed.
    #[inline]
    pub fn set(
        &mut self,
        type_: T,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        if let Some(cond) = self
            .index
            .get(&type_)
            .copied()
            .and_then(|position| self.items.get_mut(position))
        {
            let changed = cond.status != status;
            if changed {
                cond.status = status;
                cond.last_transition_time = Time(now);
            }
            cond.reason = reason;
            cond.message = message;
            return changed;
        }
        let _prev = self.index.insert(type_, self.items.len());
        self.items.push(Condition {
            type_,
            status,
            last_transition_time: Time(now),
            reason,
            message,
        });
        true
    }
}

impl<T: Copy + Ord + Debug> From<Vec<Condition<T>>> for Conditions<T> {
    #[inline]
    fn from(list: Vec<Condition<T>>) -> Self {
        let mut conditions = Self::default();
        // keep the first entry when a stored list carries duplicated types
        for cond in list {
            if conditions.index.contains_key(&cond.type_) {
                continue;
            }
            let _prev = conditions
                .index
                .insert(cond.type_, conditions.items.len());
            conditions.items.push(cond);
        }
        conditions
    }
}

impl<T: Serialize> Serialize for Conditions<T> {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Conditions<T>
where
    T: Deserialize<'de> + Copy + Ord + Debug,
{
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Condition<T>>::deserialize(deserializer).map(Self::from)
    }
}

impl<T: JsonSchema> JsonSchema for Conditions<T> {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        Vec::<Condition<T>>::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        Vec::<Condition<T>>::json_schema(gen)
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    enum Kind {
        A,
        B,
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut conds = Conditions::default();
        assert!(conds.set(Kind::A, ConditionStatus::True, "r1", "m1", at(0)));
        assert!(!conds.set(Kind::A, ConditionStatus::True, "r2", "m2", at(10)));
        let cond = conds.get(Kind::A).unwrap();
        assert_eq!(cond.last_transition_time, Time(at(0)));
        assert_eq!(cond.reason, "r2");
        assert_eq!(cond.message, "m2");

        assert!(conds.set(Kind::A, ConditionStatus::False, "r3", "", at(20)));
        assert_eq!(
            conds.get(Kind::A).unwrap().last_transition_time,
            Time(at(20))
        );
    }

    #[test]
    fn one_entry_per_type_in_insertion_order() {
        let mut conds = Conditions::default();
        let _ig = conds.set(Kind::B, ConditionStatus::Unknown, "", "", at(0));
        let _ig = conds.set(Kind::A, ConditionStatus::True, "", "", at(0));
        let _ig = conds.set(Kind::B, ConditionStatus::True, "", "", at(1));
        let _ig = conds.set(Kind::A, ConditionStatus::True, "", "", at(2));
        assert_eq!(conds.len(), 2);
        let order: Vec<_> = conds.iter().map(|c| c.type_).collect();
        assert_eq!(order, vec![Kind::B, Kind::A]);
        assert!(conds.is_true(Kind::B));
    }

    #[test]
    fn serde_keeps_order_and_rebuilds_index() {
        let mut conds = Conditions::default();
        let _ig = conds.set(Kind::B, ConditionStatus::False, "x", "y", at(0));
        let _ig = conds.set(Kind::A, ConditionStatus::True, "", "", at(0));
        let json = serde_json::to_value(&conds).unwrap();
        assert_eq!(json[0]["type"], "B");
        assert_eq!(json[0]["status"], "False");
        assert!(json[1].get("reason").is_none());

        let back: Conditions<Kind> = serde_json::from_value(json).unwrap();
        assert_eq!(back, conds);
        assert_eq!(back.status(Kind::A), Some(ConditionStatus::True));
    }
}
