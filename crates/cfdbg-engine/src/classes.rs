//! Class mirrors and the registry keyed by canonical source path.
//!
//! A single CF source file can be compiled under several logical mappings,
//! each a distinct class in the VM, so one path key holds a set of mirrors.
//! Mirrors are built eagerly on class-prepare (while the preparing thread is
//! still suspended) so breakpoints bind synchronously with the load.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use cfdbg_jdwp::{JdwpClient, JdwpError, Location, MethodId, ReferenceTypeId};

use crate::config::EngineConfig;
use crate::ids::CanonicalServerPath;

/// In-adapter mirror of one loaded page class: where its source lives and
/// which lines carry emitted code.
#[derive(Debug, Clone)]
pub(crate) struct KlassMap {
    pub(crate) source_path: CanonicalServerPath,
    pub(crate) signature: String,
    /// Identity token; unique per loaded class even when several classes
    /// share a source path.
    pub(crate) type_id: ReferenceTypeId,
    /// Sparse line → bytecode location table. Only lines with emitted code
    /// appear.
    pub(crate) line_map: HashMap<u32, Location>,
}

impl KlassMap {
    /// Builds a mirror for `type_id`, or `Ok(None)` when the class carries no
    /// usable source attribution. Stale-id errors bubble up so the caller
    /// can treat the class as collected.
    pub(crate) fn try_build(
        config: &EngineConfig,
        jdwp: &JdwpClient,
        type_id: ReferenceTypeId,
    ) -> Result<Option<KlassMap>, JdwpError> {
        let signature = jdwp.reference_type_signature(type_id)?;

        let source_file = match jdwp.reference_type_source_file(type_id) {
            Ok(file) if !file.is_empty() => file,
            Ok(_) => return Ok(None),
            Err(err) if err.is_absent_information() => return Ok(None),
            Err(err) => return Err(err),
        };
        let source_path = config.canonicalize(&source_file);

        let mut line_map = HashMap::new();
        for method in jdwp.reference_type_methods(type_id)? {
            let table = match jdwp.method_line_table(type_id, method.method_id) {
                Ok(table) => table,
                Err(err) if err.is_absent_information() => continue,
                Err(err) => return Err(err),
            };
            for entry in table.lines {
                if entry.line < 0 {
                    continue;
                }
                // First mapping wins; later methods re-listing a line point
                // at re-emitted trampolines, not at the statement start.
                line_map.entry(entry.line as u32).or_insert(Location {
                    type_tag: 1,
                    class_id: type_id,
                    method_id: method.method_id,
                    index: entry.code_index,
                });
            }
        }

        Ok(Some(KlassMap {
            source_path,
            signature,
            type_id,
            line_map,
        }))
    }

    /// Lazily detects collection of the underlying class by probing a cheap
    /// command against its id.
    pub(crate) fn is_collected(&self, jdwp: &JdwpClient) -> bool {
        match jdwp.reference_type_signature(self.type_id) {
            Ok(_) => false,
            Err(err) => err.is_object_collected(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ClassRegistry {
    mirrors: DashMap<CanonicalServerPath, Vec<KlassMap>>,
    /// method name lookups during step finalization hit the same few classes
    /// repeatedly; cache per reference type.
    methods: DashMap<ReferenceTypeId, HashMap<MethodId, String>>,
}

impl ClassRegistry {
    /// Registers a mirror under its source path (idempotent per class id).
    pub(crate) fn insert(&self, klass: KlassMap) {
        let mut set = self.mirrors.entry(klass.source_path.clone()).or_default();
        if set.iter().any(|k| k.type_id == klass.type_id) {
            return;
        }
        debug!(path = %klass.source_path, type_id = klass.type_id, "tracking class mirror");
        set.push(klass);
    }

    pub(crate) fn mirrors_for(&self, path: &CanonicalServerPath) -> Option<Vec<KlassMap>> {
        self.mirrors.get(path).map(|set| set.clone())
    }

    /// Removes specific mirrors (by identity token) under one path key.
    /// Empty sets drop the key entirely.
    pub(crate) fn remove_mirrors(&self, path: &CanonicalServerPath, type_ids: &[ReferenceTypeId]) {
        let emptied = {
            let Some(mut set) = self.mirrors.get_mut(path) else {
                return;
            };
            set.retain(|k| !type_ids.contains(&k.type_id));
            set.is_empty()
        };
        if emptied {
            self.mirrors.remove(path);
        }
        for type_id in type_ids {
            self.methods.remove(type_id);
        }
    }

    /// Drops every mirror whose class signature matches, returning the
    /// affected source paths. Used by the class-unload handler.
    pub(crate) fn remove_by_signature(&self, signature: &str) -> Vec<CanonicalServerPath> {
        let mut affected = Vec::new();
        let mut emptied = Vec::new();
        for mut entry in self.mirrors.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|k| {
                if k.signature == signature {
                    self.methods.remove(&k.type_id);
                    false
                } else {
                    true
                }
            });
            if entry.value().len() != before {
                affected.push(entry.key().clone());
                if entry.value().is_empty() {
                    emptied.push(entry.key().clone());
                }
            }
        }
        for path in emptied {
            self.mirrors.remove(&path);
        }
        affected
    }

    pub(crate) fn tracked_source_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for entry in self.mirrors.iter() {
            for klass in entry.value() {
                paths.push(klass.source_path.as_str().to_string());
            }
        }
        paths
    }

    /// Resolves a method name through the per-class cache.
    pub(crate) fn method_name(
        &self,
        jdwp: &JdwpClient,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Option<String>, JdwpError> {
        if let Some(methods) = self.methods.get(&class_id) {
            return Ok(methods.get(&method_id).cloned());
        }
        let methods: HashMap<MethodId, String> = jdwp
            .reference_type_methods(class_id)?
            .into_iter()
            .map(|m| (m.method_id, m.name))
            .collect();
        let name = methods.get(&method_id).cloned();
        self.methods.insert(class_id, methods);
        Ok(name)
    }
}
