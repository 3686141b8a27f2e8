//! Timeline Synchronisation JSON messages.

use serde::{Deserialize, Serialize};

/// Sent once after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub content_id_stem: String,
    pub timeline_selector: String,
}

impl SetupMessage {
    pub fn new(content_id_stem: &str, timeline_selector: &str) -> Self {
        SetupMessage {
            content_id_stem: content_id_stem.to_string(),
            timeline_selector: timeline_selector.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Correlates the content timeline with the WallClock.
///
/// `content_time` is in timeline ticks, `wall_clock_time` in WallClock
/// nanoseconds. Both travel as decimal strings so 64-bit values survive
/// JSON number handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTimestamp {
    /// None when the timeline is currently unavailable.
    #[serde(with = "opt_decimal")]
    pub content_time: Option<i64>,
    #[serde(with = "decimal")]
    pub wall_clock_time: i64,
    #[serde(default)]
    pub timeline_speed_multiplier: Option<f64>,
}

impl ControlTimestamp {
    pub fn new(content_time: i64, wall_clock_time: i64, speed: f64) -> Self {
        ControlTimestamp {
            content_time: Some(content_time),
            wall_clock_time,
            timeline_speed_multiplier: Some(speed),
        }
    }

    pub fn unavailable(wall_clock_time: i64) -> Self {
        ControlTimestamp { content_time: None, wall_clock_time, timeline_speed_multiplier: None }
    }

    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Missing speed means normal playback.
    pub fn speed(&self) -> f64 {
        self.timeline_speed_multiplier.unwrap_or(1.0)
    }

    pub fn is_available(&self) -> bool {
        self.content_time.is_some()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Decimal {
    Text(String),
    Number(i64),
}

impl Decimal {
    fn value<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Decimal::Text(t) => t.trim().parse().map_err(|_| E::custom(format!("not a decimal integer: {:?}", t))),
            Decimal::Number(n) => Ok(n),
        }
    }
}

mod decimal {
    use super::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Decimal::deserialize(d)?.value()
    }
}

mod opt_decimal {
    use super::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Option::<Decimal>::deserialize(d)?.map(Decimal::value).transpose()
    }
}
