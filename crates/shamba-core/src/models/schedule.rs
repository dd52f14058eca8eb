//! Crop schedule model

use serde::{Deserialize, Serialize};

use super::record::{RecordId, RecordMeta, SyncRecord};
use crate::error::{Error, Result};

/// A planned field activity for a crop on a land parcel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Land parcel the activity belongs to
    pub land_id: RecordId,
    pub crop: String,
    /// e.g. "planting", "weeding", "harvest"
    pub activity: String,
    /// Planned date (Unix ms)
    pub scheduled_for: i64,
    #[serde(default)]
    pub completed: bool,
}

/// Partial update for [`Schedule`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub land_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

fn required_text(value: Option<&str>, field: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("schedule {field} is required")))
}

impl SyncRecord for Schedule {
    const COLLECTION: &'static str = "schedules";

    type Patch = SchedulePatch;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn apply_patch(&mut self, patch: &SchedulePatch) {
        if let Some(land_id) = &patch.land_id {
            self.land_id = land_id.clone();
        }
        if let Some(crop) = &patch.crop {
            self.crop.clone_from(crop);
        }
        if let Some(activity) = &patch.activity {
            self.activity.clone_from(activity);
        }
        if let Some(scheduled_for) = patch.scheduled_for {
            self.scheduled_for = scheduled_for;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
    }

    fn from_patch(meta: RecordMeta, patch: &SchedulePatch) -> Result<Self> {
        let land_id = patch
            .land_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidInput("schedule land_id is required".into()))?;
        let scheduled_for = patch
            .scheduled_for
            .ok_or_else(|| Error::InvalidInput("schedule scheduled_for is required".into()))?;

        Ok(Self {
            meta,
            land_id,
            crop: required_text(patch.crop.as_deref(), "crop")?,
            activity: required_text(patch.activity.as_deref(), "activity")?,
            scheduled_for,
            completed: patch.completed.unwrap_or(false),
        })
    }
}
