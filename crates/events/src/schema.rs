//! Payload schemas: compilation, validation and the per-process registry.
//!
//! Schemas are JSON Schema documents, one per event `(type, version)`.
//! They are compiled once and then only read. Validation is structural:
//! payloads are never coerced or rewritten.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use pulse_core::{AppError, AppResult, ErrorCode};

use crate::EventEnvelope;

/// One structural problem found in a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// JSON pointer into the validated document (empty for the root).
    pub instance_path: String,
    pub message: String,
}

/// The validator's structured error list, carried as the `cause` of an
/// `invalid_event` error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{}", render(.0))]
pub struct SchemaViolations(pub Vec<SchemaViolation>);

impl SchemaViolations {
    pub fn iter(&self) -> impl Iterator<Item = &SchemaViolation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn render(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| {
            if v.instance_path.is_empty() {
                v.message.clone()
            } else {
                format!("{}: {}", v.instance_path, v.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// A compiled schema document.
///
/// Cheap to clone; the compiled form is shared.
#[derive(Clone)]
pub struct CompiledSchema {
    compiled: Arc<JSONSchema>,
    document: Arc<JsonValue>,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("document", &self.document)
            .finish()
    }
}

impl CompiledSchema {
    /// Check `data` against the schema, returning every violation found.
    pub fn check(&self, data: &JsonValue) -> Result<(), SchemaViolations> {
        match self.compiled.validate(data) {
            Ok(()) => Ok(()),
            Err(errors) => Err(SchemaViolations(
                errors
                    .map(|e| SchemaViolation {
                        instance_path: e.instance_path.to_string(),
                        message: e.to_string(),
                    })
                    .collect(),
            )),
        }
    }

    pub fn is_valid(&self, data: &JsonValue) -> bool {
        self.compiled.is_valid(data)
    }

    /// The source document this schema was compiled from.
    pub fn document(&self) -> &JsonValue {
        &self.document
    }
}

/// Compile a schema document.
///
/// An invalid document fails here, never later at validation time.
pub fn compile_schema(schema: &JsonValue) -> AppResult<CompiledSchema> {
    let compiled = JSONSchema::compile(schema).map_err(|e| {
        AppError::new(ErrorCode::InvalidSchema, format!("schema does not compile: {e}"))
    })?;
    Ok(CompiledSchema {
        compiled: Arc::new(compiled),
        document: Arc::new(schema.clone()),
    })
}

/// Payload validator that turns violations into `invalid_event` errors.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: CompiledSchema,
}

impl Validator {
    pub fn new(schema: CompiledSchema) -> Self {
        Self { schema }
    }

    /// Return `data` unchanged if it conforms; otherwise fail with
    /// `invalid_event` (400) carrying the [`SchemaViolations`] as cause.
    pub fn validate<'a>(&self, data: &'a JsonValue) -> AppResult<&'a JsonValue> {
        self.schema.check(data).map_err(|violations| {
            AppError::invalid_event(format!("payload rejected by schema: {violations}"))
                .with_cause(violations)
        })?;
        Ok(data)
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }
}

/// Compile `schema` and wrap it in a [`Validator`].
pub fn create_validator(schema: &JsonValue) -> AppResult<Validator> {
    compile_schema(schema).map(Validator::new)
}

/// Schema identity: event type plus schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaKey {
    pub event_type: String,
    pub version: u32,
}

impl SchemaKey {
    pub fn new(event_type: impl Into<String>, version: u32) -> Self {
        Self {
            event_type: event_type.into(),
            version,
        }
    }

    /// Parse a schema file name of the form `<type>.v<version>.json`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let (event_type, version) = stem.rsplit_once(".v")?;
        if event_type.is_empty() {
            return None;
        }
        let version = version.parse().ok().filter(|v| *v > 0)?;
        Some(Self::new(event_type, version))
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.event_type, self.version)
    }
}

/// Maps `(type, version)` to a compiled validator.
///
/// Owned by the composing service (no global state). A key can only ever
/// be bound to one document: registering the same document twice is a
/// no-op, a different document is a `schema_conflict`.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    validators: RwLock<HashMap<SchemaKey, Arc<Validator>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        event_type: impl Into<String>,
        version: u32,
        schema: &JsonValue,
    ) -> AppResult<()> {
        let key = SchemaKey::new(event_type, version);
        if key.event_type.trim().is_empty() || key.version == 0 {
            return Err(AppError::new(
                ErrorCode::InvalidSchema,
                format!("invalid schema key {key}"),
            ));
        }

        // Memoized: compile outside the lock, only once per document.
        if let Some(existing) = self.get(&key) {
            return Self::ensure_same(&key, &existing, schema);
        }
        let validator = Arc::new(create_validator(schema)?);

        let mut validators = self.validators.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = validators.get(&key) {
            return Self::ensure_same(&key, existing, schema);
        }
        debug!(schema = %key, "schema registered");
        validators.insert(key, validator);
        Ok(())
    }

    /// Register every `<type>.v<version>.json` file in `dir`.
    ///
    /// Returns the number of schemas registered. Files with other names are
    /// ignored.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> AppResult<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            AppError::new(
                ErrorCode::InvalidSchema,
                format!("cannot read schema directory {}", dir.display()),
            )
            .with_cause(e)
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| {
                    AppError::new(ErrorCode::InvalidSchema, "cannot list schema directory")
                        .with_cause(e)
                })?
                .path();
            let Some(key) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(SchemaKey::from_file_name)
            else {
                continue;
            };

            let raw = std::fs::read_to_string(&path).map_err(|e| {
                AppError::new(
                    ErrorCode::InvalidSchema,
                    format!("cannot read {}", path.display()),
                )
                .with_cause(e)
            })?;
            let document: JsonValue = serde_json::from_str(&raw).map_err(|e| {
                AppError::new(
                    ErrorCode::InvalidSchema,
                    format!("{} is not valid JSON", path.display()),
                )
                .with_cause(e)
            })?;

            self.register(key.event_type, key.version, &document)?;
            loaded += 1;
        }

        info!(dir = %dir.display(), schemas = loaded, "schemas loaded");
        Ok(loaded)
    }

    pub fn validator_for(&self, event_type: &str, version: u32) -> AppResult<Arc<Validator>> {
        let key = SchemaKey::new(event_type, version);
        self.get(&key).ok_or_else(|| {
            AppError::new(
                ErrorCode::SchemaNotRegistered,
                format!("no schema registered for {key}"),
            )
            .with_http(422)
        })
    }

    /// Validate envelope metadata and the payload against its registered schema.
    pub fn validate_envelope<'a>(
        &self,
        envelope: &'a EventEnvelope<JsonValue>,
    ) -> AppResult<&'a EventEnvelope<JsonValue>> {
        envelope.validate_metadata()?;
        self.validator_for(envelope.event_type(), envelope.version())?
            .validate(envelope.payload())?;
        Ok(envelope)
    }

    pub fn contains(&self, event_type: &str, version: u32) -> bool {
        self.get(&SchemaKey::new(event_type, version)).is_some()
    }

    pub fn keys(&self) -> Vec<SchemaKey> {
        let validators = self.validators.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = validators.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &SchemaKey) -> Option<Arc<Validator>> {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn ensure_same(key: &SchemaKey, existing: &Validator, schema: &JsonValue) -> AppResult<()> {
        if existing.schema().document() == schema {
            Ok(())
        } else {
            Err(AppError::new(
                ErrorCode::SchemaConflict,
                format!("{key} is already registered with a different schema; publish a new version"),
            )
            .with_http(409))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{EventId, TenantId};
    use serde_json::json;

    fn employee_schema() -> JsonValue {
        json!({
            "type": "object",
            "required": ["employee_id", "email"],
            "properties": {
                "employee_id": {"type": "string", "minLength": 1},
                "email": {"type": "string"},
                "department": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    #[test]
    fn validator_returns_conforming_data_unchanged() {
        let validator = create_validator(&employee_schema()).unwrap();
        let payload = json!({"employee_id": "emp-1", "email": "a@b.c"});

        let out = validator.validate(&payload).unwrap();
        assert!(std::ptr::eq(out, &payload));
        assert_eq!(out, &json!({"employee_id": "emp-1", "email": "a@b.c"}));
    }

    #[test]
    fn validator_rejects_with_structured_violations() {
        let validator = create_validator(&employee_schema()).unwrap();
        let payload = json!({"employee_id": 7});

        let err = validator.validate(&payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEvent);
        assert_eq!(err.status(), Some(400));

        let violations = err
            .cause()
            .and_then(|c| c.downcast_ref::<SchemaViolations>())
            .expect("violations as cause");
        assert!(violations.len() >= 2, "missing email + wrong type: {violations:?}");
        assert!(violations.iter().any(|v| v.instance_path == "/employee_id"));
    }

    #[test]
    fn invalid_schema_fails_at_compile_time() {
        let err = compile_schema(&json!({"type": 12})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSchema);
    }

    #[test]
    fn registry_memoizes_and_rejects_conflicts() {
        let registry = SchemaRegistry::new();
        registry.register("employee.created", 1, &employee_schema()).unwrap();
        registry.register("employee.created", 1, &employee_schema()).unwrap();
        assert_eq!(registry.len(), 1);

        let err = registry
            .register("employee.created", 1, &json!({"type": "object"}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaConflict);

        registry
            .register("employee.created", 2, &json!({"type": "object"}))
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("employee.created", 2));
    }

    #[test]
    fn missing_schema_is_an_error() {
        let registry = SchemaRegistry::new();
        let err = registry.validator_for("employee.created", 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaNotRegistered);
    }

    #[test]
    fn validate_envelope_checks_metadata_and_payload() {
        let registry = SchemaRegistry::new();
        registry.register("employee.created", 1, &employee_schema()).unwrap();
        let tenant = TenantId::parse("t1").unwrap();

        let good = EventEnvelope::with_id(
            EventId::parse("e1").unwrap(),
            "employee.created",
            1,
            "directory",
            tenant.clone(),
            json!({"employee_id": "emp-1", "email": "a@b.c"}),
        );
        assert!(registry.validate_envelope(&good).is_ok());

        let bad = EventEnvelope::new(
            "employee.created",
            1,
            "directory",
            tenant.clone(),
            json!({"email": "a@b.c"}),
        );
        assert_eq!(
            registry.validate_envelope(&bad).unwrap_err().code(),
            ErrorCode::InvalidEvent
        );

        let unknown_version =
            EventEnvelope::new("employee.created", 3, "directory", tenant, json!({}));
        assert_eq!(
            registry.validate_envelope(&unknown_version).unwrap_err().code(),
            ErrorCode::SchemaNotRegistered
        );
    }

    #[test]
    fn schema_file_names() {
        assert_eq!(
            SchemaKey::from_file_name("employee.created.v1.json"),
            Some(SchemaKey::new("employee.created", 1))
        );
        assert_eq!(
            SchemaKey::from_file_name("leave.request.approved.v12.json"),
            Some(SchemaKey::new("leave.request.approved", 12))
        );
        assert_eq!(SchemaKey::from_file_name("employee.created.json"), None);
        assert_eq!(SchemaKey::from_file_name("employee.created.v0.json"), None);
        assert_eq!(SchemaKey::from_file_name("README.md"), None);
    }

    #[test]
    fn loads_repository_schemas() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../../schemas");
        let registry = SchemaRegistry::new();
        let loaded = registry.load_dir(dir).unwrap();

        assert!(loaded >= 1);
        assert!(registry.contains("employee.created", 1));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: conforming payloads pass through untouched.
            #[test]
            fn conforming_payloads_are_not_mutated(
                id in "[a-z0-9-]{1,24}",
                email in "[a-z]{1,8}@[a-z]{1,8}\\.com",
                department in proptest::option::of("[A-Za-z ]{0,16}"),
            ) {
                let validator = create_validator(&employee_schema()).unwrap();
                let mut payload = json!({"employee_id": id, "email": email});
                if let Some(d) = department {
                    payload["department"] = json!(d);
                }
                let before = payload.clone();

                let out = validator.validate(&payload).unwrap();
                prop_assert_eq!(out, &before);
            }

            /// Property: payloads missing a required field are always rejected
            /// as invalid_event / 400.
            #[test]
            fn payloads_missing_required_fields_are_rejected(
                email in "[a-z]{1,8}@[a-z]{1,8}\\.com",
                department in "[A-Za-z ]{0,16}",
            ) {
                let validator = create_validator(&employee_schema()).unwrap();
                let payload = json!({"email": email, "department": department});

                let err = validator.validate(&payload).unwrap_err();
                prop_assert_eq!(err.code(), ErrorCode::InvalidEvent);
                prop_assert_eq!(err.status(), Some(400));
            }
        }
    }
}
