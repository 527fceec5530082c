// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action registry.
//!
//! Resolves an action id to the opaque reference handed to worker processes,
//! together with the schemas used to validate run input. Actions are owned by
//! the package import process; the engine only reads them.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::Persistence;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Opaque reference to an action, sent to the worker with every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRef {
    /// Action identifier.
    pub action_id: String,
    /// Package the action belongs to.
    pub package_id: String,
    /// Action name within the package.
    pub name: String,
    /// Worker-defined entry point.
    pub entry_point: String,
}

/// An action as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    /// Reference passed to workers.
    pub action: ActionRef,
    /// JSON Schema the run input must satisfy.
    pub input_schema: Option<Value>,
    /// JSON Schema of the result, informational.
    pub output_schema: Option<Value>,
    /// Disabled actions cannot be started.
    pub enabled: bool,
}

impl ResolvedAction {
    /// Validate run input against the declared input schema.
    ///
    /// Actions without a schema accept any JSON value.
    pub fn validate_input(&self, input: &Value) -> Result<()> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };

        let validator = jsonschema::validator_for(schema).map_err(|e| {
            Error::Validation(format!(
                "action '{}' has an invalid input schema: {}",
                self.action.action_id, e
            ))
        })?;

        let errors: Vec<String> = validator
            .iter_errors(input)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "input does not match schema of action '{}': {}",
                self.action.action_id,
                errors.join("; ")
            )))
        }
    }
}

/// Lookup of actions by id.
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    /// Resolve an action, `None` when it does not exist.
    async fn resolve_action(&self, action_id: &str) -> Result<Option<ResolvedAction>>;
}

/// Registry backed by the `actions` table.
pub struct StoreActionRegistry {
    persistence: Arc<dyn Persistence>,
}

impl StoreActionRegistry {
    /// Create a registry reading from the given store.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl ActionRegistry for StoreActionRegistry {
    async fn resolve_action(&self, action_id: &str) -> Result<Option<ResolvedAction>> {
        let Some(record) = self.persistence.get_action(action_id).await? else {
            return Ok(None);
        };

        Ok(Some(ResolvedAction {
            action: ActionRef {
                action_id: record.id,
                package_id: record.package_id,
                name: record.name,
                entry_point: record.entry_point,
            },
            input_schema: record.input_schema.map(|s| s.0),
            output_schema: record.output_schema.map(|s| s.0),
            enabled: record.enabled,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::SqlitePersistence;
    use cadence_core::persistence::{ActionRecord, Json};
    use chrono::Utc;
    use serde_json::json;

    fn action_with_schema(schema: Option<Value>) -> ResolvedAction {
        ResolvedAction {
            action: ActionRef {
                action_id: "pkg.greet".to_string(),
                package_id: "pkg".to_string(),
                name: "greet".to_string(),
                entry_point: "greet:run".to_string(),
            },
            input_schema: schema,
            output_schema: None,
            enabled: true,
        }
    }

    #[test]
    fn test_validate_input_without_schema() {
        let action = action_with_schema(None);
        assert!(action.validate_input(&json!("anything")).is_ok());
    }

    #[test]
    fn test_validate_input_against_schema() {
        let action = action_with_schema(Some(json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        })));

        assert!(action.validate_input(&json!({"name": "ada"})).is_ok());

        let err = action.validate_input(&json!({"name": 7})).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("pkg.greet"));

        assert!(action.validate_input(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_store_registry_resolves() {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        persistence
            .import_action(&ActionRecord {
                id: "pkg.greet".to_string(),
                package_id: "pkg".to_string(),
                name: "greet".to_string(),
                entry_point: "greet:run".to_string(),
                input_schema: Some(Json(json!({"type": "object"}))),
                output_schema: None,
                enabled: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let registry = StoreActionRegistry::new(persistence);
        let resolved = registry
            .resolve_action("pkg.greet")
            .await
            .unwrap()
            .expect("action should resolve");
        assert_eq!(resolved.action.entry_point, "greet:run");
        assert!(!resolved.enabled);
        assert_eq!(resolved.input_schema, Some(json!({"type": "object"})));

        assert!(registry.resolve_action("missing").await.unwrap().is_none());
    }
}
