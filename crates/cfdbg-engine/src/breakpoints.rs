//! Replayable breakpoints and the bind/rebind machinery.
//!
//! User breakpoints outlive the classes they target: a record is kept per
//! (canonical path, line) and replayed against class mirrors as they appear,
//! so a breakpoint set before the page is compiled binds the moment the class
//! prepares. DAP ids are allocated once per (path, line) and survive any
//! number of rebinds.
//!
//! The wire protocol cannot attach properties to an event request, so the id
//! and condition expression that belong to a bound request live in a side
//! table keyed by request id, consulted by the breakpoint handler.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use cfdbg_jdwp::{
    EventModifier, JdwpClient, ReferenceTypeId, EVENT_KIND_BREAKPOINT,
    SUSPEND_POLICY_EVENT_THREAD,
};

use crate::classes::{ClassRegistry, KlassMap};
use crate::error::fatal;
use crate::ids::{CanonicalServerPath, DapBreakpointId, RawIdePath};

/// Per-line result of a bind call, in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub line: u32,
    pub id: DapBreakpointId,
    pub bound: bool,
}

impl Breakpoint {
    pub(crate) fn bound(line: u32, id: DapBreakpointId) -> Self {
        Self {
            line,
            id,
            bound: true,
        }
    }

    pub(crate) fn unbound(line: u32, id: DapBreakpointId) -> Self {
        Self {
            line,
            id,
            bound: false,
        }
    }
}

/// Emitted when a class-prepare-driven rebind changes the bound state of
/// existing breakpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakpointsChangedEvent {
    pub changed: Vec<Breakpoint>,
}

impl BreakpointsChangedEvent {
    pub(crate) fn just_changes(changed: Vec<Breakpoint>) -> Self {
        Self { changed }
    }
}

/// A user breakpoint description that can be re-bound as classes load.
/// The installed request handle is absent while unbound.
#[derive(Debug, Clone)]
pub(crate) struct ReplayableCfBreakpointRequest {
    pub(crate) ide_path: RawIdePath,
    pub(crate) server_path: CanonicalServerPath,
    pub(crate) line: u32,
    pub(crate) id: DapBreakpointId,
    pub(crate) expr: Option<String>,
    pub(crate) jdwp_request: Option<i32>,
}

// Equality deliberately ignores the request handle: a record is the same
// user breakpoint whether or not it is currently installed.
impl PartialEq for ReplayableCfBreakpointRequest {
    fn eq(&self, other: &Self) -> bool {
        self.ide_path == other.ide_path
            && self.server_path == other.server_path
            && self.line == other.line
            && self.id == other.id
            && self.expr == other.expr
    }
}

impl Eq for ReplayableCfBreakpointRequest {}

/// A line to bind plus the id it must keep.
#[derive(Debug, Clone)]
pub(crate) struct BpLineAndId {
    pub(crate) ide_path: RawIdePath,
    pub(crate) server_path: CanonicalServerPath,
    pub(crate) line: u32,
    pub(crate) id: DapBreakpointId,
    pub(crate) expr: Option<String>,
}

/// What the breakpoint handler needs to know about an installed request.
#[derive(Debug, Clone)]
pub(crate) struct BoundMeta {
    pub(crate) id: DapBreakpointId,
    pub(crate) expr: Option<String>,
    pub(crate) path: CanonicalServerPath,
}

#[derive(Default)]
pub(crate) struct BreakpointEngine {
    records: DashMap<CanonicalServerPath, Vec<ReplayableCfBreakpointRequest>>,
    bound_meta: DashMap<i32, BoundMeta>,
    /// Every id ever handed out, keyed by (path, line). Never cleared: a
    /// breakpoint the user sets, clears, and sets again is the same
    /// breakpoint and must keep its id.
    id_assignments: DashMap<(CanonicalServerPath, u32), DapBreakpointId>,
    next_id: AtomicI32,
}

impl BreakpointEngine {
    fn dap_breakpoint_id_for(&self, server_path: &CanonicalServerPath, line: u32) -> DapBreakpointId {
        *self
            .id_assignments
            .entry((server_path.clone(), line))
            .or_insert_with(|| DapBreakpointId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    /// Materializes one [`BpLineAndId`] per input line, reusing the id of any
    /// prior breakpoint at the same (path, line).
    pub(crate) fn line_records(
        &self,
        ide_path: &RawIdePath,
        server_path: &CanonicalServerPath,
        lines: &[u32],
        exprs: &[Option<String>],
    ) -> Vec<BpLineAndId> {
        debug_assert_eq!(lines.len(), exprs.len());
        lines
            .iter()
            .zip(exprs.iter())
            .map(|(&line, expr)| BpLineAndId {
                ide_path: ide_path.clone(),
                server_path: server_path.clone(),
                line,
                id: self.dap_breakpoint_id_for(server_path, line),
                expr: expr.clone(),
            })
            .collect()
    }

    /// Binds `line_info` against every mirror registered for the path.
    ///
    /// With no mirrors yet, all lines are stored as unbound replayables.
    /// Otherwise existing requests for the path are cleared first (the call
    /// is idempotent), then each mirror is bound in turn; the returned list
    /// is the last successfully processed mirror's view. Mirrors found
    /// collected along the way are removed together with their records.
    pub(crate) fn bind(
        &self,
        jdwp: &JdwpClient,
        classes: &ClassRegistry,
        server_path: &CanonicalServerPath,
        line_info: &[BpLineAndId],
    ) -> Vec<Breakpoint> {
        let Some(mirror_set) = classes.mirrors_for(server_path) else {
            let mut results = Vec::with_capacity(line_info.len());
            for li in line_info {
                self.insert_record(ReplayableCfBreakpointRequest {
                    ide_path: li.ide_path.clone(),
                    server_path: li.server_path.clone(),
                    line: li.line,
                    id: li.id,
                    expr: li.expr.clone(),
                    jdwp_request: None,
                });
                results.push(Breakpoint::unbound(li.line, li.id));
            }
            return results;
        };

        self.clear_existing_breakpoints(jdwp, server_path);

        let mut results = Vec::new();
        let mut garbage: Vec<ReferenceTypeId> = Vec::new();

        for mirror in &mirror_set {
            if mirror.is_collected(jdwp) {
                // A narrow race remains between this probe and the request
                // creation below; the bind itself reports that case.
                garbage.push(mirror.type_id);
                continue;
            }
            match self.idempotent_bind(jdwp, mirror, line_info) {
                Ok(mirror_results) => results = mirror_results,
                Err(err) if err.is_object_collected() => {
                    // Partial bind against a dying class: drop what it
                    // produced so a later mirror (or none) leaves no orphans.
                    self.clear_existing_breakpoints(jdwp, server_path);
                    results = Vec::new();
                    garbage.push(mirror.type_id);
                }
                Err(err) => fatal(format_args!(
                    "binding breakpoints for {server_path} failed: {err}"
                )),
            }
        }

        if !garbage.is_empty() {
            classes.remove_mirrors(server_path, &garbage);
        }

        if results.len() != line_info.len() {
            // Every mirror turned out to be collected: same as having no
            // mirrors at all. The caller still gets one result per line.
            results = line_info
                .iter()
                .map(|li| {
                    self.insert_record(ReplayableCfBreakpointRequest {
                        ide_path: li.ide_path.clone(),
                        server_path: li.server_path.clone(),
                        line: li.line,
                        id: li.id,
                        expr: li.expr.clone(),
                        jdwp_request: None,
                    });
                    Breakpoint::unbound(li.line, li.id)
                })
                .collect();
        }

        results
    }

    /// Binds each line against one mirror's line table, recording a
    /// replayable per line either way.
    fn idempotent_bind(
        &self,
        jdwp: &JdwpClient,
        mirror: &KlassMap,
        line_info: &[BpLineAndId],
    ) -> Result<Vec<Breakpoint>, cfdbg_jdwp::JdwpError> {
        let mut results = Vec::with_capacity(line_info.len());
        for li in line_info {
            match mirror.line_map.get(&li.line) {
                None => {
                    self.insert_record(ReplayableCfBreakpointRequest {
                        ide_path: li.ide_path.clone(),
                        server_path: li.server_path.clone(),
                        line: li.line,
                        id: li.id,
                        expr: li.expr.clone(),
                        jdwp_request: None,
                    });
                    results.push(Breakpoint::unbound(li.line, li.id));
                }
                Some(location) => {
                    let request_id = jdwp.event_request_set(
                        EVENT_KIND_BREAKPOINT,
                        SUSPEND_POLICY_EVENT_THREAD,
                        vec![EventModifier::LocationOnly {
                            location: *location,
                        }],
                    )?;
                    self.bound_meta.insert(
                        request_id,
                        BoundMeta {
                            id: li.id,
                            expr: li.expr.clone(),
                            path: li.server_path.clone(),
                        },
                    );
                    self.insert_record(ReplayableCfBreakpointRequest {
                        ide_path: li.ide_path.clone(),
                        server_path: li.server_path.clone(),
                        line: li.line,
                        id: li.id,
                        expr: li.expr.clone(),
                        jdwp_request: Some(request_id),
                    });
                    results.push(Breakpoint::bound(li.line, li.id));
                }
            }
        }
        Ok(results)
    }

    /// Keeps the (path, line) space single-occupancy: a new record replaces
    /// any prior record at its line.
    fn insert_record(&self, record: ReplayableCfBreakpointRequest) {
        let mut records = self.records.entry(record.server_path.clone()).or_default();
        records.retain(|r| r.line != record.line);
        records.push(record);
    }

    /// Removes all replayable records for the path and deletes every request
    /// installed for it (across all mirrors).
    fn clear_existing_breakpoints(&self, jdwp: &JdwpClient, server_path: &CanonicalServerPath) {
        self.records.remove(server_path);
        self.purge_requests_for_path(jdwp, server_path);
    }

    fn purge_requests_for_path(&self, jdwp: &JdwpClient, server_path: &CanonicalServerPath) {
        let stale: Vec<i32> = self
            .bound_meta
            .iter()
            .filter(|entry| entry.value().path == *server_path)
            .map(|entry| *entry.key())
            .collect();
        for request_id in stale {
            self.bound_meta.remove(&request_id);
            // The class may be unloading under us; a stale-handle error here
            // is routine.
            let _ = jdwp.event_request_clear(EVENT_KIND_BREAKPOINT, request_id);
        }
    }

    pub(crate) fn clear_all_breakpoints(&self, jdwp: &JdwpClient) {
        self.records.clear();
        self.bound_meta.clear();
        if let Err(err) = jdwp.clear_all_breakpoints() {
            debug!(error = %err, "clearing VM breakpoints failed");
        }
    }

    /// Re-runs the binding procedure for a path that has pending records
    /// (class-prepare driven) and reports records whose bound state changed.
    pub(crate) fn rebind(
        &self,
        jdwp: &JdwpClient,
        classes: &ClassRegistry,
        server_path: &CanonicalServerPath,
    ) -> Option<BreakpointsChangedEvent> {
        let records = self.records.get(server_path).map(|r| r.clone())?;
        if records.is_empty() {
            return None;
        }

        let prior_bound: std::collections::HashMap<u32, bool> = records
            .iter()
            .map(|r| (r.line, r.jdwp_request.is_some()))
            .collect();

        let line_info: Vec<BpLineAndId> = records
            .into_iter()
            .map(|r| BpLineAndId {
                ide_path: r.ide_path,
                server_path: r.server_path,
                line: r.line,
                id: r.id,
                expr: r.expr,
            })
            .collect();

        let results = self.bind(jdwp, classes, server_path, &line_info);
        let changed: Vec<Breakpoint> = results
            .into_iter()
            .filter(|bp| prior_bound.get(&bp.line).copied() != Some(bp.bound))
            .collect();

        if changed.is_empty() {
            None
        } else {
            Some(BreakpointsChangedEvent::just_changes(changed))
        }
    }

    /// Whether any records exist for the path (bound or not).
    pub(crate) fn has_records_for(&self, server_path: &CanonicalServerPath) -> bool {
        self.records
            .get(server_path)
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }

    pub(crate) fn meta_for_request(&self, request_id: i32) -> Option<BoundMeta> {
        self.bound_meta.get(&request_id).map(|m| m.clone())
    }

    /// Reverts every record for the path to unbound and deletes the
    /// now-pointless requests. Used when the path's classes unload: the
    /// records stay so the next prepare rebinds them under their old ids.
    pub(crate) fn detach_bound_for_path(
        &self,
        jdwp: &JdwpClient,
        server_path: &CanonicalServerPath,
    ) {
        if let Some(mut records) = self.records.get_mut(server_path) {
            for record in records.iter_mut() {
                record.jdwp_request = None;
            }
        }
        self.purge_requests_for_path(jdwp, server_path);
    }

    /// Diagnostic listing: one (ide view, server view) pair per record.
    pub(crate) fn breakpoint_detail(&self) -> Vec<(String, String)> {
        let mut detail = Vec::new();
        for entry in self.records.iter() {
            for record in entry.value() {
                let suffix = format!(
                    ":{} ({})",
                    record.line,
                    if record.jdwp_request.is_some() {
                        "bound"
                    } else {
                        "unbound"
                    }
                );
                detail.push((
                    format!("{}{suffix}", record.ide_path),
                    format!("{}{suffix}", record.server_path),
                ));
            }
        }
        detail
    }

    #[cfg(test)]
    pub(crate) fn records_for(
        &self,
        server_path: &CanonicalServerPath,
    ) -> Vec<ReplayableCfBreakpointRequest> {
        self.records
            .get(server_path)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}
