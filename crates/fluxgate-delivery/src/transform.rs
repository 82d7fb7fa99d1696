//! Request and response transformation.
//!
//! Converts an inbound payload into the shape expected by the delivery
//! target, and an upstream response back into the caller's expected shape.
//! Three modes: passthrough, static field mapping (no code execution), and
//! tenant scripts executed in the sandbox.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use fluxgate_core::{GatewayError, OrgId, Result, SandboxKind};
use fluxgate_script::{LookupTables, SandboxError, ScriptGlobals, ScriptSandbox};

use crate::config::{FieldMapping, TransformSpec};

/// Request-side context bound into transformation scripts.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub event_type: String,
    pub org_id: OrgId,
    /// Organizational sub-unit used to scope lookup resolution.
    pub org_unit: Option<String>,
    /// Query parameters of the originating request, when HTTP-pushed.
    pub query: Value,
    /// Headers of the originating request, when HTTP-pushed.
    pub headers: Value,
    /// Raw body of the originating request.
    pub body: Value,
}

impl TransformContext {
    /// Create a minimal context for an event.
    pub fn new(event_type: impl Into<String>, org_id: OrgId) -> Self {
        Self {
            event_type: event_type.into(),
            org_id,
            org_unit: None,
            query: Value::Object(Map::new()),
            headers: Value::Object(Map::new()),
            body: Value::Null,
        }
    }

    /// JSON shape bound as the `context` script global.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "event_type": self.event_type,
            "org_id": self.org_id.to_string(),
            "query": self.query,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

/// Upstream response handed to the response transformer.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub headers: Value,
    pub body: Value,
}

/// Applies the configured reshaping for one integration or action.
///
/// Stateless apart from the shared sandbox and lookup tables; safe to share
/// across concurrent attempts.
pub struct Transformer {
    sandbox: Arc<ScriptSandbox>,
    lookups: Arc<LookupTables>,
}

impl Transformer {
    /// Create a transformer over the shared sandbox.
    #[must_use]
    pub fn new(sandbox: Arc<ScriptSandbox>) -> Self {
        Self {
            sandbox,
            lookups: Arc::new(LookupTables::new()),
        }
    }

    /// Provide lookup tables resolvable from scripts.
    #[must_use]
    pub fn with_lookups(mut self, lookups: Arc<LookupTables>) -> Self {
        self.lookups = lookups;
        self
    }

    /// Reshape an inbound payload for delivery.
    pub fn transform_request(
        &self,
        spec: &TransformSpec,
        payload: &Value,
        ctx: &TransformContext,
    ) -> Result<Value> {
        match spec {
            TransformSpec::None => Ok(payload.clone()),
            TransformSpec::Simple { mappings, statics } => {
                apply_simple(mappings, statics, payload)
            }
            TransformSpec::Script { script } => {
                let globals = ScriptGlobals::new()
                    .with_var("payload", payload.clone())
                    .with_var("context", ctx.to_json())
                    .with_lookups(self.lookups.clone());
                self.run_script(script, &globals)
            }
        }
    }

    /// Reshape an upstream response back to the caller's expected shape.
    ///
    /// Never invoked for streaming deliveries.
    pub fn transform_response(
        &self,
        spec: &TransformSpec,
        response: &ResponseContext,
        ctx: &TransformContext,
    ) -> Result<Value> {
        match spec {
            TransformSpec::None => Ok(response.body.clone()),
            TransformSpec::Simple { mappings, statics } => {
                apply_simple(mappings, statics, &response.body)
            }
            TransformSpec::Script { script } => {
                let globals = ScriptGlobals::new()
                    .with_var("payload", response.body.clone())
                    .with_var(
                        "response",
                        json!({
                            "status": response.status,
                            "headers": response.headers,
                        }),
                    )
                    .with_var("context", ctx.to_json())
                    .with_lookups(self.lookups.clone());
                self.run_script(script, &globals)
            }
        }
    }

    /// Execute a transformation script, normalizing sandbox failures onto
    /// the gateway taxonomy.
    fn run_script(&self, script: &str, globals: &ScriptGlobals) -> Result<Value> {
        let value = self
            .sandbox
            .run(script, globals)
            .map_err(sandbox_to_gateway)?;
        debug!("Transformation script completed");
        Ok(value)
    }
}

/// Normalize sandbox failures onto the gateway taxonomy.
///
/// Thrown values and runtime/compile errors become transformation failures
/// carrying the original message; resource violations keep their sandbox
/// kind so the audit trail distinguishes them.
pub(crate) fn sandbox_to_gateway(error: SandboxError) -> GatewayError {
    match error {
        SandboxError::Runtime { message } => GatewayError::transformation(message),
        SandboxError::Compile { message } => GatewayError::transformation(message),
        SandboxError::Timeout { timeout_ms } => GatewayError::Sandbox {
            kind: SandboxKind::Timeout,
            message: format!("script exceeded {timeout_ms}ms deadline"),
        },
        SandboxError::LimitExceeded { message } => GatewayError::Sandbox {
            kind: SandboxKind::LimitExceeded,
            message,
        },
    }
}

/// Apply static field mappings and static values. No code execution.
fn apply_simple(
    mappings: &[FieldMapping],
    statics: &std::collections::HashMap<String, Value>,
    source: &Value,
) -> Result<Value> {
    let mut output = Value::Object(Map::new());

    for mapping in mappings {
        match get_path(source, &mapping.source) {
            Some(value) => set_path(&mut output, &mapping.target, value.clone()),
            None => {
                if let Some(default) = &mapping.default_value {
                    set_path(&mut output, &mapping.target, default.clone());
                } else if mapping.required {
                    return Err(GatewayError::transformation(format!(
                        "required field '{}' is missing",
                        mapping.source
                    )));
                }
            }
        }
    }

    for (path, value) in statics {
        set_path(&mut output, path, value.clone());
    }

    Ok(output)
}

/// Read a dot-notation path from a JSON value.
fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    value.pointer(&format!("/{}", path.replace('.', "/")))
}

/// Write a dot-notation path into a JSON object, creating intermediates.
fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            if let Value::Object(map) = current {
                map.insert((*segment).to_string(), value);
            }
            return;
        }

        if let Value::Object(map) = current {
            current = map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        } else {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxgate_script::LookupTable;

    fn transformer() -> Transformer {
        Transformer::new(Arc::new(ScriptSandbox::new()))
    }

    fn ctx() -> TransformContext {
        TransformContext::new("order.created", OrgId::new())
    }

    fn order_payload() -> Value {
        json!({
            "order": {"id": "o-1", "total": 125},
            "customer": "c-9",
            "currency": "EUR"
        })
    }

    #[test]
    fn test_none_passes_through() {
        let payload = order_payload();
        let result = transformer()
            .transform_request(&TransformSpec::None, &payload, &ctx())
            .unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn test_simple_mapping() {
        let spec = TransformSpec::Simple {
            mappings: vec![
                FieldMapping {
                    source: "order.id".to_string(),
                    target: "reference".to_string(),
                    required: true,
                    default_value: None,
                },
                FieldMapping {
                    source: "order.total".to_string(),
                    target: "amounts.total".to_string(),
                    required: false,
                    default_value: None,
                },
            ],
            statics: [("source".to_string(), json!("fluxgate"))]
                .into_iter()
                .collect(),
        };

        let result = transformer()
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap();

        assert_eq!(result["reference"], "o-1");
        assert_eq!(result["amounts"]["total"], 125);
        assert_eq!(result["source"], "fluxgate");
    }

    #[test]
    fn test_simple_required_missing_fails() {
        let spec = TransformSpec::Simple {
            mappings: vec![FieldMapping {
                source: "order.missing".to_string(),
                target: "x".to_string(),
                required: true,
                default_value: None,
            }],
            statics: Default::default(),
        };

        let err = transformer()
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSFORMATION_FAILED");
    }

    #[test]
    fn test_simple_default_applies() {
        let spec = TransformSpec::Simple {
            mappings: vec![FieldMapping {
                source: "order.missing".to_string(),
                target: "region".to_string(),
                required: true,
                default_value: Some(json!("emea")),
            }],
            statics: Default::default(),
        };

        let result = transformer()
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap();
        assert_eq!(result["region"], "emea");
    }

    #[test]
    fn test_script_transformation() {
        let spec = TransformSpec::Script {
            script: r#"
                #{
                    reference: payload.order.id,
                    total_cents: payload.order.total * 100,
                    event: context.event_type
                }
            "#
            .to_string(),
        };

        let result = transformer()
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap();

        assert_eq!(result["reference"], "o-1");
        assert_eq!(result["total_cents"], 12500);
        assert_eq!(result["event"], "order.created");
    }

    #[test]
    fn test_script_throw_becomes_transformation_error() {
        let spec = TransformSpec::Script {
            script: r#"throw "unmappable order";"#.to_string(),
        };

        let err = transformer()
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap_err();

        assert_eq!(err.error_code(), "TRANSFORMATION_FAILED");
        assert!(err.to_string().contains("unmappable order"));
    }

    #[test]
    fn test_script_lookup_capability() {
        let mut table = LookupTable::new();
        table.insert("EUR", "978");
        let lookups = Arc::new(LookupTables::new().with_table("currency", table));

        let transformer = transformer().with_lookups(lookups);
        let spec = TransformSpec::Script {
            script: r#"
                let code = lookup("currency", payload.currency);
                #{ currency_code: if code == () { "unknown" } else { code } }
            "#
            .to_string(),
        };

        let result = transformer
            .transform_request(&spec, &order_payload(), &ctx())
            .unwrap();
        assert_eq!(result["currency_code"], "978");
    }

    #[test]
    fn test_response_transform_sees_status() {
        let spec = TransformSpec::Script {
            script: r#"#{ ok: response.status == 201, id: payload.id }"#.to_string(),
        };

        let response = ResponseContext {
            status: 201,
            headers: json!({}),
            body: json!({"id": "r-7"}),
        };

        let result = transformer()
            .transform_response(&spec, &response, &ctx())
            .unwrap();

        assert_eq!(result["ok"], true);
        assert_eq!(result["id"], "r-7");
    }

    #[test]
    fn test_response_none_returns_body() {
        let response = ResponseContext {
            status: 200,
            headers: json!({}),
            body: json!({"ack": true}),
        };

        let result = transformer()
            .transform_response(&TransformSpec::None, &response, &ctx())
            .unwrap();
        assert_eq!(result, json!({"ack": true}));
    }
}
