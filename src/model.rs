use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Fuel grades offered by the logging form; sent to LubeLogger as a tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FuelType {
    SP95,
    SP98,
    SP100,
    E5,
    E10,
    E85,
}

impl FuelType {
    pub const ALL: [FuelType; 6] = [
        FuelType::SP95,
        FuelType::SP98,
        FuelType::SP100,
        FuelType::E5,
        FuelType::E10,
        FuelType::E85,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FuelType::SP95 => "SP95",
            FuelType::SP98 => "SP98",
            FuelType::SP100 => "SP100",
            FuelType::E5 => "E5",
            FuelType::E10 => "E10",
            FuelType::E85 => "E85",
        }
    }
}

impl Default for FuelType {
    fn default() -> Self {
        FuelType::SP95
    }
}

impl fmt::Display for FuelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FuelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FuelType::ALL
            .iter()
            .copied()
            .find(|ft| ft.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown fuel type '{}'", s))
    }
}

/// Fields the form collects for one fill-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GasRecord {
    pub date: NaiveDate,
    pub odometer: f64,
    pub fuel_consumed: f64,
    pub cost: f64,
    pub is_fill_to_full: bool,
    #[serde(default)]
    pub missed_fuel_up: bool,
    pub fuel_type: FuelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// What gets queued: the record plus the vehicle it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    pub vehicle_id: i64,
    #[serde(flatten)]
    pub record: GasRecord,
}

/// A vehicle as returned by `GET /api/vehicles`. Unknown fields are kept so
/// cached snapshots round-trip without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: i64,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub license_plate: Option<String>,
    #[serde(default)]
    pub sold_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Vehicle {
    pub fn is_sold(&self) -> bool {
        self.sold_date.is_some()
    }

    pub fn display_name(&self) -> String {
        let make = self.make.as_deref().unwrap_or("");
        let model = self.model.as_deref().unwrap_or("");
        match self.license_plate.as_deref() {
            Some(plate) if !plate.is_empty() => format!("{} {} ({})", make, model, plate),
            _ => format!("{} {}", make, model),
        }
        .trim()
        .to_string()
    }
}
