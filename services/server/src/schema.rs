//! In-memory schema registry.
//!
//! Holds one compiled JSON Schema validator per registered key. The engine
//! persists the schema documents to the index so external tools can read
//! them; this registry is the live counterpart consulted on every append to
//! a schema-bound stream.

use crate::error::{StoreError, StoreResult};
use jsonschema::Validator;
use std::collections::HashMap;

pub struct SchemaRegistry {
    validators: HashMap<String, Validator>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry {
            validators: HashMap::new(),
        }
    }

    /// Compile and register a schema document under `key`, replacing any
    /// previous registration.
    pub fn register(&mut self, key: &str, document: &serde_json::Value) -> StoreResult<()> {
        let validator = jsonschema::validator_for(document).map_err(|e| StoreError::InvalidSchema {
            key: key.to_owned(),
            message: e.to_string(),
        })?;
        self.validators.insert(key.to_owned(), validator);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.validators.contains_key(key)
    }

    /// Validate `value` against the schema registered under `key`.
    ///
    /// An unregistered key validates vacuously; schema enforcement only
    /// applies where a validator is actually installed.
    pub fn validate(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let Some(validator) = self.validators.get(key) else {
            return Ok(());
        };
        validator
            .validate(value)
            .map_err(|e| StoreError::SchemaValidation(e.to_string()))
    }
}
