use crate::core::{Result, StockError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Id carried by a record that the repository has not numbered yet.
pub const UNASSIGNED_ID: u64 = 0;

pub const DEFAULT_LOW_THRESHOLD: u32 = 5;
pub const DEFAULT_HIGH_THRESHOLD: u32 = 15;

fn default_low_threshold() -> u32 {
    DEFAULT_LOW_THRESHOLD
}

fn default_high_threshold() -> u32 {
    DEFAULT_HIGH_THRESHOLD
}

/// One spare-part line in the inventory.
///
/// Field names on disk follow the historical file layout: the brand is
/// persisted as `Brand` and the thresholds as `low_status`/`high_status`.
/// Missing fields fall back to their defaults so older files still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "Brand", default)]
    pub brand: String,
    #[serde(default)]
    pub product_family: String,
    #[serde(default)]
    pub spare_part: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(rename = "low_status", default = "default_low_threshold")]
    pub low_threshold: u32,
    #[serde(rename = "high_status", default = "default_high_threshold")]
    pub high_threshold: u32,
}

impl InventoryRecord {
    /// Creates an unnumbered record with default thresholds.
    pub fn new(
        product_family: impl Into<String>,
        spare_part: impl Into<String>,
        quantity: u32,
    ) -> Self {
        Self {
            id: UNASSIGNED_ID,
            brand: String::new(),
            product_family: product_family.into(),
            spare_part: spare_part.into(),
            quantity,
            low_threshold: DEFAULT_LOW_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    pub fn with_thresholds(mut self, low: u32, high: u32) -> Self {
        self.low_threshold = low;
        self.high_threshold = high;
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn is_unassigned(&self) -> bool {
        self.id == UNASSIGNED_ID
    }

    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            product_family: &self.product_family,
            spare_part: &self.spare_part,
        }
    }

    pub fn status(&self) -> StockStatus {
        StockStatus::classify(self.quantity, self.low_threshold, self.high_threshold)
    }

    /// Rejects records whose natural key is blank.
    pub fn validate(&self) -> Result<()> {
        if self.product_family.trim().is_empty() {
            return Err(StockError::data(
                format!("record {}", self.id),
                "product_family must not be empty",
            ));
        }
        if self.spare_part.trim().is_empty() {
            return Err(StockError::data(
                format!("record {}", self.id),
                "spare_part must not be empty",
            ));
        }
        Ok(())
    }
}

/// The `(product_family, spare_part)` pair used to detect mergeable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey<'a> {
    pub product_family: &'a str,
    pub spare_part: &'a str,
}

impl<'a> NaturalKey<'a> {
    pub fn new(product_family: &'a str, spare_part: &'a str) -> Self {
        Self {
            product_family,
            spare_part,
        }
    }
}

impl fmt::Display for NaturalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_family, self.spare_part)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockStatus {
    Low,
    Mid,
    High,
}

impl StockStatus {
    pub fn classify(quantity: u32, low_threshold: u32, high_threshold: u32) -> Self {
        if quantity <= low_threshold {
            Self::Low
        } else if quantity >= high_threshold {
            Self::High
        } else {
            Self::Mid
        }
    }

    /// What an operator is expected to do about a line in this state.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Low => "salvage units to top up stock",
            Self::Mid => "review stock level",
            Self::High => "none",
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_persisted_field_names() {
        let json = r#"{"id":4,"Brand":"Acme","product_family":"Pump","spare_part":"Seal",
            "quantity":9,"low_status":2,"high_status":20}"#;
        let record: InventoryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 4);
        assert_eq!(record.brand, "Acme");
        assert_eq!(record.low_threshold, 2);
        assert_eq!(record.high_threshold, 20);

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["Brand"], "Acme");
        assert_eq!(back["low_status"], 2);
        assert!(back.get("brand").is_none());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let record: InventoryRecord =
            serde_json::from_str(r#"{"product_family":"Pump","spare_part":"Seal"}"#).unwrap();
        assert!(record.is_unassigned());
        assert_eq!(record.brand, "");
        assert_eq!(record.quantity, 0);
        assert_eq!(record.low_threshold, DEFAULT_LOW_THRESHOLD);
        assert_eq!(record.high_threshold, DEFAULT_HIGH_THRESHOLD);
    }

    #[test]
    fn status_boundaries() {
        assert_eq!(StockStatus::classify(5, 5, 15), StockStatus::Low);
        assert_eq!(StockStatus::classify(6, 5, 15), StockStatus::Mid);
        assert_eq!(StockStatus::classify(15, 5, 15), StockStatus::High);
        assert_eq!(StockStatus::classify(0, 0, 0), StockStatus::Low);
    }

    #[test]
    fn blank_natural_key_is_rejected() {
        assert!(InventoryRecord::new("Pump", "Seal", 1).validate().is_ok());
        assert!(InventoryRecord::new(" ", "Seal", 1).validate().is_err());
        assert!(InventoryRecord::new("Pump", "", 1).validate().is_err());
    }
}
