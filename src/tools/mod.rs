pub mod publish;
pub mod search;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::{SchemaError, ToolError};

pub use publish::{PUBLISH_NOTIFICATION_TOOL, publish_notification_tool};
pub use search::{SearchHit, TavilyConfig, WebSearchClient, web_search_tool};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Text(String),
    /// Ends the run with this message as the final response.
    Done(String),
}

type DynDependency = Arc<dyn Any + Send + Sync>;
type ToolHandler = dyn Fn(Value, &DependencyMap) -> BoxFuture<'static, Result<ToolOutcome, ToolError>>
    + Send
    + Sync;

/// Shared values handed to tool handlers, looked up by type or by name.
///
/// Trait objects are registered as `Arc<dyn Trait>` values and fetched with
/// `get::<Arc<dyn Trait>>()`.
#[derive(Clone, Default, Debug)]
pub struct DependencyMap {
    typed: Arc<RwLock<HashMap<TypeId, DynDependency>>>,
    named: Arc<RwLock<HashMap<String, DynDependency>>>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.typed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self
            .typed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())?
            .clone();
        Arc::downcast::<T>(value).ok()
    }

    pub fn insert_named<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    pub fn get_named<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self
            .named
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)?
            .clone();
        Arc::downcast::<T>(value).ok()
    }

    /// Returns a new map holding `self` with `overrides` layered on top.
    pub fn merged_with(&self, overrides: &DependencyMap) -> DependencyMap {
        let merged = DependencyMap::new();

        {
            let mut typed = merged.typed.write().unwrap_or_else(PoisonError::into_inner);
            for source in [&self.typed, &overrides.typed] {
                let source = source.read().unwrap_or_else(PoisonError::into_inner);
                typed.extend(source.iter().map(|(key, value)| (*key, value.clone())));
            }
        }

        {
            let mut named = merged.named.write().unwrap_or_else(PoisonError::into_inner);
            for source in [&self.named, &overrides.named] {
                let source = source.read().unwrap_or_else(PoisonError::into_inner);
                named.extend(source.iter().map(|(key, value)| (key.clone(), value.clone())));
            }
        }

        merged
    }
}

#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    json_schema: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let unconfigured = name.clone();
        Self {
            name,
            description: description.into(),
            json_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            }),
            handler: Arc::new(move |_args, _deps| {
                let message = format!("handler for '{unconfigured}' not configured");
                Box::pin(async move { Err(ToolError::Execution(message)) })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &DependencyMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutcome, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, deps| Box::pin(handler(args, deps)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub async fn execute(
        &self,
        args: Value,
        dependencies: &DependencyMap,
    ) -> Result<ToolOutcome, ToolError> {
        validate_arguments(self.name(), &self.json_schema, &args)?;
        (self.handler)(args, dependencies).await
    }
}

/// Reads a required string argument after schema validation has run.
pub(crate) fn string_arg(tool: &str, args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing string field: {key}"),
        })
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    if schema_obj.get("type").and_then(Value::as_str) != Some("object") {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

fn validate_arguments(tool_name: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let args_obj = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;
    let schema_obj = schema
        .as_object()
        .ok_or_else(|| invalid("tool schema must be a JSON object".to_string()))?;

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        if let Some(missing) = required
            .iter()
            .filter_map(Value::as_str)
            .find(|field| !args_obj.contains_key(*field))
        {
            return Err(invalid(format!("missing required field: {missing}")));
        }
    }

    let empty = serde_json::Map::new();
    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if schema_obj.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
        if let Some(unknown) = args_obj.keys().find(|key| !properties.contains_key(*key)) {
            return Err(invalid(format!("unknown field: {unknown}")));
        }
    }

    for (key, value) in args_obj {
        let expected = properties
            .get(key)
            .and_then(|field| field.get("type"))
            .and_then(Value::as_str);
        if let Some(type_name) = expected
            && !value_matches_type(value, type_name)
        {
            return Err(invalid(format!("field '{key}' must be of type {type_name}")));
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_tool() -> ToolSpec {
        ToolSpec::new("echo", "echo text back")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "times": {"type": "integer"}
                },
                "required": ["text"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args, _deps| async move {
                let text = string_arg("echo", &args, "text")?;
                let times = args.get("times").and_then(Value::as_u64).unwrap_or(1) as usize;
                Ok(ToolOutcome::Text(text.repeat(times)))
            })
    }

    #[test]
    fn schema_validation_rejects_bad_roots_and_required() {
        assert!(matches!(
            ToolSpec::new("bad", "bad").with_schema(json!("object")),
            Err(SchemaError::SchemaNotObject)
        ));
        assert!(matches!(
            ToolSpec::new("bad", "bad").with_schema(json!({"type": "string"})),
            Err(SchemaError::RootTypeMustBeObject)
        ));
        assert!(matches!(
            ToolSpec::new("bad", "bad").with_schema(json!({"type": "object", "required": [1]})),
            Err(SchemaError::InvalidRequired)
        ));
    }

    #[tokio::test]
    async fn arguments_are_validated_before_the_handler_runs() {
        let tool = echo_tool();
        let deps = DependencyMap::new();

        let missing = tool.execute(json!({}), &deps).await.expect_err("missing");
        assert!(missing.to_string().contains("missing required field: text"));

        let unknown = tool
            .execute(json!({"text": "a", "extra": true}), &deps)
            .await
            .expect_err("unknown");
        assert!(unknown.to_string().contains("unknown field: extra"));

        let wrong_type = tool
            .execute(json!({"text": "a", "times": "two"}), &deps)
            .await
            .expect_err("wrong type");
        assert!(wrong_type.to_string().contains("must be of type integer"));

        let ok = tool
            .execute(json!({"text": "ab", "times": 2}), &deps)
            .await
            .expect("valid call");
        assert_eq!(ok, ToolOutcome::Text("abab".to_string()));
    }

    #[tokio::test]
    async fn unconfigured_handler_reports_tool_name() {
        let err = ToolSpec::new("noop", "nothing")
            .execute(json!({}), &DependencyMap::new())
            .await
            .expect_err("no handler");
        assert!(err.to_string().contains("'noop'"));
    }

    #[test]
    fn dependency_overrides_win_for_typed_and_named() {
        let base = DependencyMap::new();
        base.insert::<u32>(1);
        base.insert_named("topic", "base".to_string());

        let overrides = DependencyMap::new();
        overrides.insert::<u32>(9);
        overrides.insert_named("topic", "override".to_string());

        let merged = base.merged_with(&overrides);
        assert_eq!(merged.get::<u32>().as_deref(), Some(&9));
        assert_eq!(
            merged.get_named::<String>("topic").as_deref().map(String::as_str),
            Some("override")
        );
        assert_eq!(base.get::<u32>().as_deref(), Some(&1));
    }

    #[test]
    fn trait_objects_are_registered_as_arc_values() {
        trait Greeter: Send + Sync {
            fn greet(&self) -> String;
        }
        struct Hello;
        impl Greeter for Hello {
            fn greet(&self) -> String {
                "hello".to_string()
            }
        }

        let deps = DependencyMap::new();
        let greeter: Arc<dyn Greeter> = Arc::new(Hello);
        deps.insert(greeter);

        let found = deps.get::<Arc<dyn Greeter>>().expect("registered");
        assert_eq!(found.greet(), "hello");
    }
}
