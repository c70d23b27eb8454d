//! Bidirectional name mapping.

use crate::strategy::{HashIds, IdStrategy};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use strand_core::{Error, Result};

/// Exported mapping shape: `service -> (method -> wire id)`. Produced by a
/// build-time generation pass and loaded by the runtime peer.
pub type MappingDocument = HashMap<String, HashMap<String, String>>;

/// Default length for generated hash-based ids
pub const DEFAULT_ID_LENGTH: usize = 8;

const MAX_GENERATION_ATTEMPTS: usize = 16;

#[derive(Default)]
struct Maps {
    /// service -> method -> wire id (doubles as the export shape)
    forward: MappingDocument,
    /// wire id -> (service, method)
    reverse: HashMap<String, (String, String)>,
}

/// Two-way mapping between semantic `(service, method)` names and the short
/// identifiers that appear on the wire.
///
/// Read-mostly after startup registration or a document load; both maps sit
/// behind one `RwLock` and every write goes through `register` or `load`.
pub struct NameRegistry {
    maps: RwLock<Maps>,
    strategy: Box<dyn IdStrategy>,
}

impl NameRegistry {
    /// Create a registry with the default hash-based strategy
    pub fn new() -> Self {
        Self::with_strategy(Box::new(HashIds::new(DEFAULT_ID_LENGTH)))
    }

    /// Create a registry with a specific generation strategy
    pub fn with_strategy(strategy: Box<dyn IdStrategy>) -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            strategy,
        }
    }

    /// Register a method, generating a wire id when none is given.
    ///
    /// Registering the same pair again returns the existing id. An explicit
    /// id that is already taken by a different pair, or a generated id that
    /// cannot be made collision-free, is rejected.
    pub fn register(&self, service: &str, method: &str, id: Option<&str>) -> Result<String> {
        let mut maps = self.maps.write();

        if let Some(existing) = maps.forward.get(service).and_then(|m| m.get(method)) {
            return match id {
                Some(requested) if requested != existing => Err(Error::InvalidArgument(format!(
                    "'{}.{}' is already registered as '{}'",
                    service, method, existing
                ))),
                _ => Ok(existing.clone()),
            };
        }

        let wire_id = match id {
            Some(explicit) => {
                if maps.reverse.contains_key(explicit) {
                    return Err(Error::InvalidArgument(format!(
                        "wire id '{}' is already in use",
                        explicit
                    )));
                }
                explicit.to_string()
            }
            None => self.generate_free_id(&maps, service, method)?,
        };

        maps.forward
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), wire_id.clone());
        maps.reverse
            .insert(wire_id.clone(), (service.to_string(), method.to_string()));
        Ok(wire_id)
    }

    fn generate_free_id(&self, maps: &Maps, service: &str, method: &str) -> Result<String> {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = self.strategy.generate(service, method);
            if !maps.reverse.contains_key(&candidate) {
                return Ok(candidate);
            }
            if self.strategy.is_deterministic() {
                // retrying reproduces the same id
                break;
            }
        }
        Err(Error::InvalidArgument(format!(
            "could not generate a collision-free wire id for '{}.{}'",
            service, method
        )))
    }

    /// Look up the wire id for a name pair
    pub fn resolve_id(&self, service: &str, method: &str) -> Option<String> {
        self.maps
            .read()
            .forward
            .get(service)
            .and_then(|m| m.get(method))
            .cloned()
    }

    /// Look up the name pair for a wire id
    pub fn resolve_name(&self, id: &str) -> Option<(String, String)> {
        self.maps.read().reverse.get(id).cloned()
    }

    /// The identifier to put on the wire for a name pair: the mapped id when
    /// one exists, the method name verbatim otherwise. The verbatim fallback
    /// keeps callers working against a peer with mapping disabled.
    pub fn wire_id(&self, service: &str, method: &str) -> String {
        self.resolve_id(service, method)
            .unwrap_or_else(|| method.to_string())
    }

    /// Load an exported mapping document, all-or-nothing.
    ///
    /// The full id set is scanned before anything is committed: a duplicate
    /// id inside the document, or a conflict with an id already registered
    /// to a different pair, rejects the entire load.
    pub fn load(&self, document: &MappingDocument) -> Result<()> {
        let mut maps = self.maps.write();

        let mut seen: HashSet<&str> = HashSet::new();
        for (service, methods) in document {
            for (method, id) in methods {
                if !seen.insert(id.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate wire id '{}' in mapping document",
                        id
                    )));
                }
                if let Some((s, m)) = maps.reverse.get(id.as_str()) {
                    if s != service || m != method {
                        return Err(Error::InvalidArgument(format!(
                            "wire id '{}' conflicts with registered '{}.{}'",
                            id, s, m
                        )));
                    }
                }
            }
        }

        for (service, methods) in document {
            for (method, id) in methods {
                maps.forward
                    .entry(service.clone())
                    .or_default()
                    .insert(method.clone(), id.clone());
                maps.reverse
                    .insert(id.clone(), (service.clone(), method.clone()));
            }
        }
        Ok(())
    }

    /// Dump the full mapping for exchange with an independently built peer
    pub fn export(&self) -> MappingDocument {
        self.maps.read().forward.clone()
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.maps.read().reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}
