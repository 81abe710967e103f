//! Inspections: validating stored state against client expectations.
//!
//! An inspection command names an entity and a check (existence or a
//! property value). The result travels back as an inspection notification
//! addressed by the request id; a code of zero means the expectation held.

use std::sync::Arc;

use tracing::debug;

use crate::commands::{Inspection, InspectionCheck};
use crate::error::{Result, SinkError};
use crate::notifier::{Notification, Notifier};
use crate::store::EntityStore;

/// Answers inspection commands from the store.
pub struct Inspector {
    store: EntityStore,
    notifier: Arc<Notifier>,
}

impl Inspector {
    /// Creates an inspector over a read-only store handle.
    pub fn new(store: EntityStore, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Runs one inspection and emits the result notification.
    pub fn process_command(&self, payload: &[u8]) -> Result<()> {
        let inspection: Inspection = bincode::deserialize(payload)
            .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
        debug!(id = %inspection.id, "Processing inspection");

        let failure: Option<String> = match &inspection.check {
            InspectionCheck::Existence { exists } => {
                let actual = self
                    .store
                    .exists(inspection.entity_type, inspection.entity_id)?;
                (actual != *exists).then(|| {
                    format!(
                        "Entity {} expected exists={}, got {}",
                        inspection.entity_id, exists, actual
                    )
                })
            }
            InspectionCheck::Property { property, expected } => {
                match self
                    .store
                    .read_latest(inspection.entity_type, inspection.entity_id)?
                {
                    None => Some(format!("Entity {} not found", inspection.entity_id)),
                    Some(entity) => {
                        let actual = entity.property(property);
                        (actual != Some(expected)).then(|| {
                            format!(
                                "Property {} mismatch: expected {:?}, got {:?}",
                                property, expected, actual
                            )
                        })
                    }
                }
            }
        };

        let notification = match failure {
            None => Notification::inspection(inspection.id, 0, ""),
            Some(message) => Notification::inspection(inspection.id, 1, message),
        };
        self.notifier.notify(notification);
        Ok(())
    }
}
