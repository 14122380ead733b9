use crate::error::LiveError;
use crate::types::{FunctionCall, FunctionDeclaration, FunctionResponse, Schema, SchemaType};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, LiveError>> + Send + 'static>>;

/// A locally executed function the model may call.
pub trait ToolHandler: Send + Sync {
    fn call(&self, args: Value) -> ToolFuture;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, LiveError>> + Send + 'static,
{
    fn call(&self, args: Value) -> ToolFuture {
        Box::pin(self(args))
    }
}

/// The single response produced for one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub response: FunctionResponse,
    /// Human-readable status line for the UI.
    pub status: String,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    declarations: Vec<FunctionDeclaration>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("declarations", &self.declarations)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under the declaration's name, replacing any
    /// previous registration of that name.
    pub fn register<H>(&mut self, declaration: FunctionDeclaration, handler: H) -> &mut Self
    where
        H: ToolHandler + 'static,
    {
        self.declarations.retain(|d| d.name != declaration.name);
        self.handlers
            .insert(declaration.name.clone(), Arc::new(handler));
        self.declarations.push(declaration);
        self
    }

    pub fn declarations(&self) -> &[FunctionDeclaration] {
        &self.declarations
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolves one call. The returned future owns everything it needs, so it
    /// can be spawned, and it always yields exactly one response tagged with
    /// the call's id.
    pub fn dispatch(
        &self,
        call: FunctionCall,
    ) -> impl Future<Output = ToolOutcome> + Send + use<> {
        let handler = self.handlers.get(&call.name).cloned();
        async move {
            let FunctionCall { id, name, args } = call;
            let (text, status) = match handler {
                None => {
                    warn!("[Tools] No handler registered for '{}'.", name);
                    let text = format!("Function {} not implemented.", name);
                    (text.clone(), text)
                }
                Some(handler) => {
                    debug!("[Tools] Calling '{}' with {}.", name, args);
                    let location = args
                        .get("location")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    match handler.call(args).await {
                        Ok(text) => {
                            let status = match location {
                                Some(location) => {
                                    format!("Called {} for {}. Result: {}", name, location, text)
                                }
                                None => format!("Called {}. Result: {}", name, text),
                            };
                            (text, status)
                        }
                        Err(e) => {
                            warn!("[Tools] '{}' failed: {}", name, e);
                            let text = format!("Function {} failed: {}", name, e);
                            (text.clone(), text)
                        }
                    }
                }
            };
            info!("[Tools] {}", status);
            ToolOutcome {
                response: FunctionResponse {
                    id,
                    name,
                    response: json!({ "result": text }),
                },
                status,
            }
        }
    }
}

pub fn get_weather_declaration() -> FunctionDeclaration {
    let mut properties = BTreeMap::new();
    properties.insert(
        "location".to_string(),
        Schema {
            schema_type: SchemaType::String,
            description: Some("The city or location to get weather for.".to_string()),
            properties: None,
            required: None,
        },
    );
    FunctionDeclaration {
        name: "getWeather".to_string(),
        description: "Get the current weather for a given location.".to_string(),
        parameters: Some(Schema {
            schema_type: SchemaType::Object,
            description: Some("Get the current weather for a given location.".to_string()),
            properties: Some(properties),
            required: Some(vec!["location".to_string()]),
        }),
    }
}

/// Mocked weather service with artificial latency.
#[derive(Debug, Clone, Copy)]
pub struct WeatherLookup {
    latency: Duration,
}

impl Default for WeatherLookup {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(1),
        }
    }
}

impl WeatherLookup {
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }

    pub async fn lookup(&self, location: &str) -> String {
        tokio::time::sleep(self.latency).await;
        let lower = location.to_lowercase();
        if lower.contains("san francisco") {
            format!(
                "The weather in {} is partly cloudy with a temperature of 60°F.",
                location
            )
        } else if lower.contains("new york") {
            format!(
                "The weather in {} is sunny with a temperature of 75°F.",
                location
            )
        } else {
            format!("Weather data for {} is not available.", location)
        }
    }
}

impl ToolHandler for WeatherLookup {
    fn call(&self, args: Value) -> ToolFuture {
        let lookup = *self;
        Box::pin(async move {
            let location = args
                .get("location")
                .and_then(Value::as_str)
                .filter(|l| !l.trim().is_empty())
                .ok_or_else(|| LiveError::Dispatch("missing required argument 'location'".into()))?
                .to_string();
            Ok(lookup.lookup(&location).await)
        })
    }
}

/// A registry holding only `getWeather`.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(get_weather_declaration(), WeatherLookup::default());
    registry
}
