//! Session integrity scoring and review ordering.
//!
//! The weights and thresholds below are the scoring contract; they are not
//! configuration.

use crate::types::ArrivalRecord;
use serde::Serialize;

pub const LOW_MATCH_THRESHOLD: f32 = 0.60;
pub const GEOFENCE_RADIUS_M: f32 = 150.0;

const LOW_MATCH_WEIGHT: u32 = 18;
const OUTSIDE_WEIGHT: u32 = 22;
const LATE_WEIGHT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskLabel {
    HighRisk,
    Warning,
    Safe,
}

impl RiskLabel {
    pub fn from_score(value: u8) -> Self {
        if value < 60 {
            RiskLabel::HighRisk
        } else if value < 85 {
            RiskLabel::Warning
        } else {
            RiskLabel::Safe
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLabel::HighRisk => "high-risk",
            RiskLabel::Warning => "warning",
            RiskLabel::Safe => "safe",
        }
    }
}

/// Review tier of a single arrival, most suspicious first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    Verified = 0,
    Late = 1,
    Outside = 2,
    LowMatch = 3,
}

impl RiskTier {
    pub fn of(record: &ArrivalRecord) -> Self {
        if is_low_match(record) {
            RiskTier::LowMatch
        } else if is_outside(record) {
            RiskTier::Outside
        } else if record.is_late {
            RiskTier::Late
        } else {
            RiskTier::Verified
        }
    }

    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Status and warning text for a report card.
    pub fn describe(&self) -> (&'static str, Option<&'static str>) {
        match self {
            RiskTier::LowMatch => ("Face Mismatch", Some("Possible proxy attendance")),
            RiskTier::Outside => ("Outside Campus", Some("GPS location abnormal")),
            RiskTier::Late => ("Late", Some("Marked after session start")),
            RiskTier::Verified => ("Verified", None),
        }
    }
}

fn is_low_match(record: &ArrivalRecord) -> bool {
    record.similarity_score.is_some_and(|s| s < LOW_MATCH_THRESHOLD)
}

fn is_outside(record: &ArrivalRecord) -> bool {
    record.distance_meters.is_some_and(|d| d > GEOFENCE_RADIUS_M)
}

/// Integrity summary of a set of arrivals. Always derived, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustAssessment {
    /// 0–100, higher is more trustworthy.
    pub value: u8,
    pub label: RiskLabel,
    /// Indices into the scored slice, most suspicious first.
    pub ordering: Vec<usize>,
    pub total: usize,
    pub low_match: usize,
    pub outside: usize,
    pub late: usize,
}

impl TrustAssessment {
    /// Records in review order.
    pub fn ordered<'a>(&self, records: &'a [ArrivalRecord]) -> Vec<&'a ArrivalRecord> {
        self.ordering.iter().filter_map(|&i| records.get(i)).collect()
    }
}

/// Score a batch of arrivals.
pub fn score(records: &[ArrivalRecord]) -> TrustAssessment {
    let low_match = records.iter().filter(|r| is_low_match(r)).count();
    let outside = records.iter().filter(|r| is_outside(r)).count();
    let late = records.iter().filter(|r| r.is_late).count();

    let penalty = low_match as u32 * LOW_MATCH_WEIGHT + outside as u32 * OUTSIDE_WEIGHT + late as u32 * LATE_WEIGHT;
    let value = 100u32.saturating_sub(penalty) as u8;

    let mut ordering: Vec<usize> = (0..records.len()).collect();
    // Stable: ties keep arrival order.
    ordering.sort_by_key(|&i| std::cmp::Reverse(RiskTier::of(&records[i])));

    TrustAssessment {
        value,
        label: RiskLabel::from_score(value),
        ordering,
        total: records.len(),
        low_match,
        outside,
        late,
    }
}
