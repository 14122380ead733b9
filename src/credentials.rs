use crate::error::LiveError;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

/// Source of the API key used to open a session.
pub trait CredentialGate: Send + Sync {
    fn selected_key(&self) -> Option<SecretString>;

    /// Asks the user or environment to provide a key. Returns whether a key
    /// should now be available.
    fn request_selection(&self) -> bool;
}

/// Returns the selected key, asking for one first if necessary.
pub fn ensure_api_key(gate: &dyn CredentialGate) -> Result<SecretString, LiveError> {
    let usable = |key: SecretString| (!key.expose_secret().trim().is_empty()).then_some(key);

    if let Some(key) = gate.selected_key().and_then(usable) {
        debug!("[Conversation] API key already selected.");
        return Ok(key);
    }
    info!("[Conversation] No API key selected, requesting selection.");
    if !gate.request_selection() {
        warn!("[Conversation] API key selection was not completed.");
    }
    gate.selected_key()
        .and_then(usable)
        .ok_or_else(|| LiveError::Credential("API Key not selected.".into()))
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads the key from `GEMINI_API_KEY`, then `API_KEY`. Empty values are
/// ignored.
pub struct EnvCredentials {
    lookup: Lookup,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }
}

impl std::fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentials").finish_non_exhaustive()
    }
}

impl EnvCredentials {
    pub const VARIABLES: [&'static str; 2] = ["GEMINI_API_KEY", "API_KEY"];

    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `lookup` in place of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl CredentialGate for EnvCredentials {
    fn selected_key(&self) -> Option<SecretString> {
        Self::VARIABLES.iter().find_map(|name| {
            (self.lookup)(name)
                .filter(|value| !value.trim().is_empty())
                .map(SecretString::from)
        })
    }

    fn request_selection(&self) -> bool {
        warn!(
            "[Conversation] Set {} in the environment to select an API key.",
            Self::VARIABLES.join(" or ")
        );
        false
    }
}

/// A fixed key, mostly for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub SecretString);

impl CredentialGate for StaticCredentials {
    fn selected_key(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }

    fn request_selection(&self) -> bool {
        true
    }
}
