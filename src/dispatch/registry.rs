//! Action registry for routing requests by action name.
//!
//! The registry maps the `action` string of a REQUEST payload to a handler.
//! Handlers are pure functions over their deserialized parameters; a typed
//! wrapper takes care of parsing `params` into the handler's input type.
//!
//! # Example
//!
//! ```
//! use streamwire::dispatch::{ActionContext, ActionRegistry};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Shout { text: String }
//!
//! let mut registry = ActionRegistry::new();
//! registry.register("shout", |p: Shout, _ctx: &ActionContext| {
//!     Ok(json!(format!("{}!", p.text)))
//! });
//!
//! let ctx = ActionContext::default();
//! let result = registry.run("shout", json!({"text": "hey"}), &ctx).unwrap();
//! assert_eq!(result.unwrap(), json!("hey!"));
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::server::EngineStats;

/// Result of running an action: a JSON result value, or an error message
/// reported to the peer in-band.
pub type ActionResult = std::result::Result<Value, String>;

/// Trait for action handlers working on raw JSON parameters.
pub trait Action: Send + Sync + 'static {
    /// Run the action against the request parameters.
    fn call(&self, params: Value, ctx: &ActionContext) -> ActionResult;
}

/// Wrapper that deserializes parameters before calling the handler.
pub struct TypedAction<F, T>
where
    F: Fn(T, &ActionContext) -> ActionResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedAction<F, T>
where
    F: Fn(T, &ActionContext) -> ActionResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    /// Create a new typed action.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> Action for TypedAction<F, T>
where
    F: Fn(T, &ActionContext) -> ActionResult + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    fn call(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let parsed: T = serde_json::from_value(params)
            .map_err(|e| format!("invalid params: {e}"))?;
        (self.handler)(parsed, ctx)
    }
}

/// Shared state handed to every action handler.
#[derive(Clone, Default)]
pub struct ActionContext {
    /// Process-wide engine counters, readable by actions such as `stats`.
    pub stats: Arc<EngineStats>,
}

impl ActionContext {
    /// Create a context over existing counters.
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self { stats }
    }
}

/// Registry mapping action names to handlers.
pub struct ActionRegistry {
    actions: HashMap<String, Box<dyn Action>>,
}

impl ActionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Create a registry preloaded with the reference actions:
    /// `echo`, `uppercase`, `reverse`, `stats`.
    pub fn with_builtins() -> Self {
        #[derive(serde::Deserialize)]
        struct TextParams {
            text: String,
        }

        let mut registry = Self::new();

        registry.register("echo", |params: Value, _ctx: &ActionContext| Ok(params));

        registry.register("uppercase", |p: TextParams, _ctx: &ActionContext| {
            Ok(json!(p.text.to_uppercase()))
        });

        registry.register("reverse", |p: TextParams, _ctx: &ActionContext| {
            Ok(json!(p.text.chars().rev().collect::<String>()))
        });

        registry.register("stats", |_: Value, ctx: &ActionContext| {
            Ok(ctx.stats.snapshot())
        });

        registry
    }

    /// Register a handler under an action name.
    ///
    /// The handler receives its deserialized parameter type; deserialization
    /// failures surface as in-band error messages, not connection errors.
    pub fn register<F, T>(&mut self, name: &str, handler: F)
    where
        F: Fn(T, &ActionContext) -> ActionResult + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        self.actions
            .insert(name.to_string(), Box::new(TypedAction::new(handler)));
    }

    /// Check whether an action is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Run a named action. Returns `None` for unknown actions.
    pub fn run(&self, name: &str, params: Value, ctx: &ActionContext) -> Option<ActionResult> {
        self.actions.get(name).map(|a| a.call(params, ctx))
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
