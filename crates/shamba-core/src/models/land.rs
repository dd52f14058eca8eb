//! Land parcel model

use serde::{Deserialize, Serialize};

use super::record::{RecordMeta, SyncRecord};
use crate::error::{Error, Result};

/// A land parcel registered by a farmer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Land {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Display name of the parcel
    pub name: String,
    /// Surveyed size in hectares
    pub area_hectares: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub soil_type: Option<String>,
}

/// Partial update for [`Land`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_hectares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_type: Option<String>,
}

impl SyncRecord for Land {
    const COLLECTION: &'static str = "lands";

    type Patch = LandPatch;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn apply_patch(&mut self, patch: &LandPatch) {
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(area) = patch.area_hectares {
            self.area_hectares = area;
        }
        if let Some(location) = &patch.location {
            self.location = Some(location.clone());
        }
        if let Some(soil_type) = &patch.soil_type {
            self.soil_type = Some(soil_type.clone());
        }
    }

    fn from_patch(meta: RecordMeta, patch: &LandPatch) -> Result<Self> {
        let name = patch
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::InvalidInput("land name is required".into()))?;
        let area_hectares = patch
            .area_hectares
            .ok_or_else(|| Error::InvalidInput("land area_hectares is required".into()))?;
        if !area_hectares.is_finite() || area_hectares < 0.0 {
            return Err(Error::InvalidInput(
                "land area_hectares must be a non-negative number".into(),
            ));
        }

        Ok(Self {
            meta,
            name: name.to_string(),
            area_hectares,
            location: patch.location.clone(),
            soil_type: patch.soil_type.clone(),
        })
    }
}
