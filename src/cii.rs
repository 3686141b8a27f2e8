//! Content-Info values as delivered by a CII client.
//!
//! A CII message only carries the properties that changed, so every field is
//! optional and updates are merged into the last known state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineProperties {
    pub units_per_tick: u64,
    pub units_per_second: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// A timeline the TV offers for synchronisation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineOption {
    pub timeline_selector: String,
    pub timeline_properties: TimelineProperties,
}

impl TimelineOption {
    pub fn new(selector: &str, units_per_tick: u64, units_per_second: u64) -> Self {
        TimelineOption {
            timeline_selector: selector.to_string(),
            timeline_properties: TimelineProperties { units_per_tick, units_per_second, accuracy: None },
        }
    }

    /// Ticks per second. Never zero.
    pub fn tick_rate(&self) -> u64 {
        let p = &self.timeline_properties;
        (p.units_per_second / p.units_per_tick.max(1)).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timelines: Option<Vec<TimelineOption>>,
}

/// Which properties an update actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ContentInfoChanges {
    pub protocol_version: bool,
    pub msr_url: bool,
    pub content_id: bool,
    pub content_id_status: bool,
    pub presentation_status: bool,
    pub wc_url: bool,
    pub ts_url: bool,
    pub timelines: bool,
}

impl ContentInfoChanges {
    pub fn any(&self) -> bool {
        self.protocol_version
            || self.msr_url
            || self.content_id
            || self.content_id_status
            || self.presentation_status
            || self.wc_url
            || self.ts_url
            || self.timelines
    }
}

fn merge_field<T: Clone + PartialEq>(current: &mut Option<T>, update: &Option<T>) -> bool {
    match update {
        Some(v) if current.as_ref() != Some(v) => {
            *current = Some(v.clone());
            true
        }
        _ => false,
    }
}

impl ContentInfo {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Applies the fields present in `update`. Absent fields keep their value.
    pub fn merge(&mut self, update: &ContentInfo) -> ContentInfoChanges {
        ContentInfoChanges {
            protocol_version: merge_field(&mut self.protocol_version, &update.protocol_version),
            msr_url: merge_field(&mut self.msr_url, &update.msr_url),
            content_id: merge_field(&mut self.content_id, &update.content_id),
            content_id_status: merge_field(&mut self.content_id_status, &update.content_id_status),
            presentation_status: merge_field(&mut self.presentation_status, &update.presentation_status),
            wc_url: merge_field(&mut self.wc_url, &update.wc_url),
            ts_url: merge_field(&mut self.ts_url, &update.ts_url),
            timelines: merge_field(&mut self.timelines, &update.timelines),
        }
    }

    pub fn find_timeline(&self, selector: &str) -> Option<&TimelineOption> {
        self.timelines.as_ref()?.iter().find(|t| t.timeline_selector == selector)
    }
}
