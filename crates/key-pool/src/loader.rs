//! Key pool loading from configuration
//!
//! The pool is read once at startup: the primary variable (e.g.
//! `GEMINI_API_KEY`) first, then `GEMINI_API_KEY_1`, `GEMINI_API_KEY_2`, ...
//! up to `MAX_NUMBERED_KEYS`. Numbered lookup stops at the first variable that
//! is not set; variables that are set but blank are skipped. The resulting
//! order is the rotation order and never changes afterwards.

use std::fmt;

use common::Secret;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default primary variable name.
pub const DEFAULT_KEY_VAR: &str = "GEMINI_API_KEY";

/// Default upper bound on numbered key variables.
pub const MAX_NUMBERED_KEYS: usize = 5;

/// One API key handed out by the rotation manager.
///
/// Carries its pool slot so the manager can record cooldowns without keeping
/// a second copy of the key. Debug output shows the slot label only.
#[derive(Clone)]
pub struct Credential {
    slot: usize,
    secret: Secret<String>,
}

impl Credential {
    /// Position of this key in the pool (0-based).
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Log-safe name, `key_1` for slot 0.
    pub fn label(&self) -> String {
        format!("key_{}", self.slot + 1)
    }

    /// The raw key, for building the outbound request only.
    pub fn expose(&self) -> &str {
        self.secret.expose()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.label())
    }
}

/// Ordered, immutable, non-empty set of API keys.
pub struct KeyPool {
    keys: Vec<Secret<String>>,
}

impl KeyPool {
    /// Build a pool from an explicit list. Blank entries are dropped; an empty
    /// result is a configuration error.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        Self::from_secrets(
            keys.into_iter().map(Secret::new).collect(),
            DEFAULT_KEY_VAR,
        )
    }

    /// Load keys through `lookup`, which maps a variable name to its value.
    pub fn load<F>(var_name: &str, max_numbered: usize, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut keys = Vec::new();

        if let Some(primary) = lookup(var_name) {
            keys.push(Secret::new(primary));
        }

        for n in 1..=max_numbered {
            let name = format!("{var_name}_{n}");
            match lookup(&name) {
                Some(value) => keys.push(Secret::new(value)),
                None => {
                    debug!(variable = %name, "numbered key not set, stopping lookup");
                    break;
                }
            }
        }

        Self::from_secrets(keys, var_name)
    }

    /// Load keys from the process environment.
    pub fn from_env(var_name: &str, max_numbered: usize) -> Result<Self> {
        Self::load(var_name, max_numbered, |name| std::env::var(name).ok())
    }

    fn from_secrets(keys: Vec<Secret<String>>, var_name: &str) -> Result<Self> {
        let keys: Vec<Secret<String>> = keys.into_iter().filter(|k| !k.is_blank()).collect();
        if keys.is_empty() {
            return Err(Error::Configuration(var_name.to_string()));
        }
        info!(keys = keys.len(), "API key pool loaded");
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Credential handle for `slot`.
    pub fn credential(&self, slot: usize) -> Option<Credential> {
        self.keys.get(slot).map(|secret| Credential {
            slot,
            secret: secret.clone(),
        })
    }

    /// Whether `credential` was issued from this pool.
    pub fn owns(&self, credential: &Credential) -> bool {
        self.keys
            .get(credential.slot)
            .is_some_and(|secret| secret.matches(credential.expose()))
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.keys.len())
            .finish()
    }
}
