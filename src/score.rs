//! ESAL scoring.
//!
//! Converts per-class vehicle counts into an equivalent single axle load total
//! and maps that total onto a maintenance recommendation. Engines are
//! immutable; callers that need different tables build a new engine and swap
//! the `Arc`.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROUTINE_LABEL: &str = "routine monitoring";
pub const DEFAULT_IDLE_LABEL: &str = "no action";

const DAMAGE_STEP: f64 = 200_000.0;
const MAX_DAMAGE_LEVEL: u8 = 5;

const URGENCY_CRITICAL: f64 = 1_000_000.0;
const URGENCY_HIGH: f64 = 850_000.0;
const URGENCY_MEDIUM: f64 = 700_000.0;

/// Class name to per-vehicle load. Keys are stored lower-cased and keep
/// insertion order, which decides the substring fallback.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreTable {
    entries: IndexMap<String, f64>,
}

impl ScoreTable {
    pub fn new<I, K>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut map = IndexMap::new();
        for (key, value) in entries {
            let key = key.as_ref().trim().to_lowercase();
            if key.is_empty() {
                return Err(anyhow!("score table keys must not be empty"));
            }
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("score for '{}' must be a non-negative number", key));
            }
            map.insert(key, value);
        }
        Ok(Self { entries: map })
    }

    /// Exact match first, then the first key contained in the class name.
    pub fn lookup(&self, class_name: &str) -> Option<f64> {
        let name = class_name.trim().to_lowercase();
        if let Some(value) = self.entries.get(&name) {
            return Some(*value);
        }
        self.entries
            .iter()
            .find(|(key, _)| name.contains(key.as_str()))
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ScoreTable {
    fn default() -> Self {
        let entries: &[(&str, f64)] = &[
            ("bicycle", 0.0),
            ("person", 0.0),
            ("people", 0.0),
            ("car", 1.0),
            ("cars", 1.0),
            ("suv", 1.0),
            ("motorbike", 1.0),
            ("motorcycle", 1.0),
            ("bike", 1.0),
            ("van", 150.0),
            ("work_van", 7950.0),
            ("caravan", 7950.0),
            ("bus", 10430.0),
            ("construction_vehicle", 24820.0),
            ("trailer", 24820.0),
            ("truck", 25160.0),
        ];
        Self {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value: f64,
    pub label: String,
}

impl Threshold {
    pub fn new(value: f64, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }
}

pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        Threshold::new(1_000_000.0, "full repaving (100% of design, year 20)"),
        Threshold::new(850_000.0, "intermediate repair (85% of design, year 17)"),
        Threshold::new(700_000.0, "surface repair (70% of design, year 14)"),
        Threshold::new(500_000.0, "preventive maintenance (50% of design, year 10)"),
    ]
}

/// One row of the maintenance schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceStage {
    pub stage: String,
    pub cumulative_esal: f64,
    pub design_pct: u32,
    pub timing_years: u32,
    pub note: String,
}

pub fn default_schedule() -> Vec<MaintenanceStage> {
    let row = |stage: &str, esal: f64, pct: u32, years: u32, note: &str| MaintenanceStage {
        stage: stage.to_string(),
        cumulative_esal: esal,
        design_pct: pct,
        timing_years: years,
        note: note.to_string(),
    };
    vec![
        row(
            "preventive",
            500_000.0,
            50,
            10,
            "crack sealing and surface treatment",
        ),
        row("surface", 700_000.0, 70, 14, "5 cm mill and overlay"),
        row("intermediate", 850_000.0, 85, 17, "10 cm mill and overlay"),
        row("full", 1_000_000.0, 100, 20, "full-depth repaving down to the base"),
    ]
}

/// Maintenance urgency derived from a cumulative total.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }

    /// Days until maintenance should be scheduled.
    pub fn lead_days(&self) -> u32 {
        match self {
            Urgency::Critical => 7,
            Urgency::High => 30,
            Urgency::Medium => 90,
            Urgency::Low => 180,
        }
    }

    /// Work the urgency calls for.
    pub fn maintenance_type(&self) -> &'static str {
        match self {
            Urgency::Critical => "reconstruction",
            Urgency::High => "rehabilitation",
            Urgency::Medium => "surface_treatment",
            Urgency::Low => "preventive",
        }
    }

    /// 1 (low) to 4 (critical).
    pub fn priority(&self) -> u8 {
        match self {
            Urgency::Low => 1,
            Urgency::Medium => 2,
            Urgency::High => 3,
            Urgency::Critical => 4,
        }
    }

    /// Budget estimate for `maintenance_type`, in local currency units.
    pub fn estimated_cost(&self) -> f64 {
        match self {
            Urgency::Low => 100_000.0,
            Urgency::Medium => 500_000.0,
            Urgency::High => 2_000_000.0,
            Urgency::Critical => 10_000_000.0,
        }
    }

    /// Only high and critical analyses put work on the schedule.
    pub fn needs_scheduling(&self) -> bool {
        *self >= Urgency::High
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoreSummary {
    pub total: f64,
    /// Subtotal per class, keyed as the counts were.
    pub breakdown: BTreeMap<String, f64>,
}

#[derive(Clone, Debug)]
pub struct ScoreEngine {
    table: ScoreTable,
    /// Sorted by descending value.
    thresholds: Vec<Threshold>,
    routine_label: String,
    idle_label: String,
    schedule: Vec<MaintenanceStage>,
}

impl ScoreEngine {
    pub fn new(table: ScoreTable, thresholds: Vec<Threshold>) -> Result<Self> {
        for threshold in &thresholds {
            if !threshold.value.is_finite() {
                return Err(anyhow!("threshold '{}' is not a finite number", threshold.label));
            }
        }
        let mut thresholds = thresholds;
        thresholds.sort_by(|a, b| b.value.total_cmp(&a.value));
        Ok(Self::from_sorted(table, thresholds))
    }

    fn from_sorted(table: ScoreTable, thresholds: Vec<Threshold>) -> Self {
        Self {
            table,
            thresholds,
            routine_label: DEFAULT_ROUTINE_LABEL.to_string(),
            idle_label: DEFAULT_IDLE_LABEL.to_string(),
            schedule: Vec::new(),
        }
        .with_schedule(default_schedule())
    }

    /// Labels used when no threshold is reached: `routine` for a positive
    /// total, `idle` for zero.
    pub fn with_labels(mut self, routine: impl Into<String>, idle: impl Into<String>) -> Self {
        self.routine_label = routine.into();
        self.idle_label = idle.into();
        self
    }

    pub fn with_schedule(mut self, mut schedule: Vec<MaintenanceStage>) -> Self {
        schedule.sort_by(|a, b| b.cumulative_esal.total_cmp(&a.cumulative_esal));
        self.schedule = schedule;
        self
    }

    pub fn table(&self) -> &ScoreTable {
        &self.table
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Per-vehicle load for a class; 0 when nothing matches.
    pub fn score_for(&self, class_name: &str) -> f64 {
        self.table.lookup(class_name).unwrap_or(0.0)
    }

    pub fn total_score(&self, counts: &BTreeMap<String, u64>) -> ScoreSummary {
        let mut summary = ScoreSummary::default();
        for (class_name, count) in counts {
            let subtotal = *count as f64 * self.score_for(class_name);
            summary.total += subtotal;
            summary.breakdown.insert(class_name.clone(), subtotal);
        }
        summary
    }

    pub fn recommendation_for(&self, total: f64) -> &str {
        for threshold in &self.thresholds {
            if total >= threshold.value {
                return &threshold.label;
            }
        }
        if total > 0.0 {
            &self.routine_label
        } else {
            &self.idle_label
        }
    }

    /// Human-readable lines, largest count first.
    pub fn detailed_breakdown(&self, counts: &BTreeMap<String, u64>) -> Vec<String> {
        let mut rows: Vec<(&String, &u64)> = counts.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        rows.into_iter()
            .map(|(class_name, count)| {
                let per = self.score_for(class_name);
                format!(
                    "{}: {} x {} = {:.1}",
                    class_name,
                    count,
                    per,
                    *count as f64 * per
                )
            })
            .collect()
    }

    /// Highest schedule stage the total has reached.
    pub fn maintenance_stage(&self, total: f64) -> Option<&MaintenanceStage> {
        self.schedule.iter().find(|s| total >= s.cumulative_esal)
    }

    pub fn damage_level(&self, total: f64) -> u8 {
        let level = (total.max(0.0) / DAMAGE_STEP).floor() + 1.0;
        level.min(MAX_DAMAGE_LEVEL as f64) as u8
    }

    pub fn urgency(&self, total: f64) -> Urgency {
        if total >= URGENCY_CRITICAL {
            Urgency::Critical
        } else if total >= URGENCY_HIGH {
            Urgency::High
        } else if total >= URGENCY_MEDIUM {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }
}

impl Default for ScoreEngine {
    fn default() -> Self {
        // Defaults are sorted descending already.
        Self::from_sorted(ScoreTable::default(), default_thresholds())
    }
}
