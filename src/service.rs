use crate::core::{Result, StockError};
use crate::model::{InventoryRecord, NaturalKey, StockStatus};
use crate::storage::RecordRepository;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of [`InventoryService::add_or_merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new record was stored.
    Added(InventoryRecord),
    /// The natural key already existed; its quantity was increased.
    Merged {
        record: InventoryRecord,
        previous_quantity: u32,
    },
}

impl AddOutcome {
    pub fn record(&self) -> &InventoryRecord {
        match self {
            Self::Added(record) | Self::Merged { record, .. } => record,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub brand: Option<String>,
    pub product_family: Option<String>,
    pub spare_part: Option<String>,
    pub quantity: Option<i64>,
    pub low_threshold: Option<u32>,
    pub high_threshold: Option<u32>,
}

/// Business rules on top of the repository.
///
/// A record whose quantity reaches zero is kept with quantity 0; records
/// are only ever removed by [`InventoryService::delete`].
pub struct InventoryService {
    repository: Arc<RecordRepository>,
}

impl InventoryService {
    pub fn new(repository: Arc<RecordRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<RecordRepository> {
        &self.repository
    }

    pub async fn list_with_status(&self) -> Vec<(InventoryRecord, StockStatus)> {
        self.repository
            .get_all()
            .await
            .into_iter()
            .map(|record| {
                let status = record.status();
                (record, status)
            })
            .collect()
    }

    pub async fn get(&self, id: u64) -> Option<InventoryRecord> {
        self.repository.get_by_id(id).await
    }

    /// Adds stock. A record with the same natural key absorbs the incoming
    /// quantity instead of creating a duplicate line.
    pub async fn add_or_merge(&self, incoming: InventoryRecord) -> Result<AddOutcome> {
        incoming.validate()?;

        let outcome = self
            .repository
            .modify(|set| {
                let existing = set.find_by_natural_key(incoming.natural_key()).cloned();
                match existing {
                    Some(mut record) => {
                        let previous_quantity = record.quantity;
                        record.quantity = record.quantity.saturating_add(incoming.quantity);
                        set.update(record.clone());
                        Ok(AddOutcome::Merged {
                            record,
                            previous_quantity,
                        })
                    }
                    None => Ok(AddOutcome::Added(set.add(incoming))),
                }
            })
            .await?;

        match &outcome {
            AddOutcome::Added(record) => info!(
                id = record.id,
                brand = %record.brand,
                product_family = %record.product_family,
                spare_part = %record.spare_part,
                quantity = record.quantity,
                status = %record.status(),
                action = record.status().action(),
                "item added"
            ),
            AddOutcome::Merged {
                record,
                previous_quantity,
            } => info!(
                id = record.id,
                brand = %record.brand,
                product_family = %record.product_family,
                spare_part = %record.spare_part,
                old_quantity = previous_quantity,
                new_quantity = record.quantity,
                status = %record.status(),
                action = record.status().action(),
                "quantity merged"
            ),
        }
        Ok(outcome)
    }

    /// Takes `amount` units out of stock, stopping at zero.
    ///
    /// `Ok(None)` when no record has `id`.
    pub async fn subtract_quantity(
        &self,
        id: u64,
        amount: u32,
    ) -> Result<Option<InventoryRecord>> {
        let result = self
            .repository
            .modify(|set| {
                let Some(mut record) = set.get_by_id(id).cloned() else {
                    return Ok(None);
                };
                let previous = record.quantity;
                record.quantity = record.quantity.saturating_sub(amount);
                set.update(record.clone());
                Ok(Some((record, previous)))
            })
            .await?;

        match result {
            Some((record, previous)) => {
                info!(
                    id = record.id,
                    product_family = %record.product_family,
                    spare_part = %record.spare_part,
                    old_quantity = previous,
                    new_quantity = record.quantity,
                    status = %record.status(),
                    action = record.status().action(),
                    "quantity subtracted"
                );
                Ok(Some(record))
            }
            None => {
                warn!(id, "subtract requested for unknown record");
                Ok(None)
            }
        }
    }

    /// Applies `patch` to the record with `id`.
    ///
    /// Negative quantities are clamped to zero. Moving a record onto a
    /// natural key owned by another record is refused; the merge rule only
    /// applies when stock is added.
    pub async fn update_fields(
        &self,
        id: u64,
        patch: RecordPatch,
    ) -> Result<Option<InventoryRecord>> {
        let result = self
            .repository
            .modify(|set| {
                let Some(before) = set.get_by_id(id).cloned() else {
                    return Ok(None);
                };
                let mut after = before.clone();
                if let Some(brand) = patch.brand {
                    after.brand = brand;
                }
                if let Some(product_family) = patch.product_family {
                    after.product_family = product_family;
                }
                if let Some(spare_part) = patch.spare_part {
                    after.spare_part = spare_part;
                }
                if let Some(quantity) = patch.quantity {
                    after.quantity = u32::try_from(quantity.max(0)).unwrap_or(u32::MAX);
                }
                if let Some(low) = patch.low_threshold {
                    after.low_threshold = low;
                }
                if let Some(high) = patch.high_threshold {
                    after.high_threshold = high;
                }
                after.validate()?;

                let key = NaturalKey::new(&after.product_family, &after.spare_part);
                if let Some(owner) = set.find_by_natural_key(key).filter(|other| other.id != id) {
                    return Err(StockError::data(
                        format!("record {id}"),
                        format!("natural key {key} already belongs to record {}", owner.id),
                    ));
                }

                set.update(after.clone());
                Ok(Some((before, after)))
            })
            .await?;

        match result {
            Some((before, after)) => {
                info!(
                    id,
                    brand = %after.brand,
                    product_family = %after.product_family,
                    spare_part = %after.spare_part,
                    old_quantity = before.quantity,
                    new_quantity = after.quantity,
                    status = %after.status(),
                    action = after.status().action(),
                    "item updated"
                );
                Ok(Some(after))
            }
            None => {
                warn!(id, "update requested for unknown record");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, id: u64) -> Result<bool> {
        let removed = self
            .repository
            .modify(|set| {
                let record = set.get_by_id(id).cloned();
                if record.is_some() {
                    set.delete(id);
                }
                Ok(record)
            })
            .await?;

        match removed {
            Some(record) => {
                info!(
                    id,
                    product_family = %record.product_family,
                    spare_part = %record.spare_part,
                    quantity = record.quantity,
                    status = %record.status(),
                    "item deleted"
                );
                Ok(true)
            }
            None => {
                warn!(id, "delete requested for unknown record");
                Ok(false)
            }
        }
    }
}
