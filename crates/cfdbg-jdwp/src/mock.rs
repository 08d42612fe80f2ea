//! A small scriptable JDWP VM for tests.
//!
//! It speaks real JDWP over a localhost socket but implements only the subset
//! of commands the cfdbg engine issues. Tests drive the debuggee side through
//! [`MockVmHandle`]: starting and killing threads, loading/unloading/collecting
//! classes, and firing breakpoint hits, each of which emits the corresponding
//! composite event packet and applies the request's suspend policy to the
//! mock's suspend-count bookkeeping.

use std::{
    collections::HashMap,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    codec::{encode_command, encode_reply, read_packet, JdwpReader, JdwpWriter, RawPacket, HANDSHAKE},
    types::{
        FrameInfo, JdwpIdSizes, JdwpValue, LineTableEntry, Location, ReferenceTypeId, ThreadId,
        ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT, EVENT_KIND_BREAKPOINT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD, EVENT_KIND_THREAD_DEATH,
        EVENT_KIND_THREAD_START, SUSPEND_POLICY_EVENT_THREAD,
    },
};

const ERROR_NOT_IMPLEMENTED: u16 = 99;

#[derive(Debug, Clone)]
pub struct MockMethod {
    pub method_id: u64,
    pub name: String,
    pub signature: String,
    pub line_table: Vec<LineTableEntry>,
}

#[derive(Debug, Clone)]
pub struct MockClass {
    pub type_id: ReferenceTypeId,
    pub signature: String,
    /// Dotted class name, matched against `ClassMatch` patterns.
    pub name: String,
    pub source_file: Option<String>,
    pub superclass: Option<ReferenceTypeId>,
    pub methods: Vec<MockMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockModifier {
    Count { count: u32 },
    ThreadOnly { thread: ThreadId },
    ClassOnly { class_id: ReferenceTypeId },
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

#[derive(Debug, Clone)]
pub struct MockEventRequest {
    pub request_id: i32,
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub modifiers: Vec<MockModifier>,
    /// Hits left on a `Count` filter; the request expires when it reaches zero.
    pub remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MockThread {
    name: String,
    alive: bool,
    suspend_count: u32,
    frames: Vec<FrameInfo>,
}

#[derive(Default)]
struct MockState {
    threads: Mutex<HashMap<ThreadId, MockThread>>,
    classes: Mutex<HashMap<ReferenceTypeId, MockClass>>,
    collected: Mutex<HashMap<ReferenceTypeId, String>>,
    requests: Mutex<Vec<MockEventRequest>>,
    invoked_threads: Mutex<HashMap<i64, ThreadId>>,
    writer: Mutex<Option<TcpStream>>,
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    next_buffer_key: AtomicI64,
    shutdown: AtomicBool,
}

pub struct MockVm {
    addr: SocketAddr,
    state: Arc<MockState>,
}

/// Cheap clone handed to tests (and to a test's worker-bridge impl).
#[derive(Clone)]
pub struct MockVmHandle {
    state: Arc<MockState>,
}

impl MockVm {
    pub fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());

        let serve_state = state.clone();
        std::thread::Builder::new()
            .name("cfdbg-mock-vm".to_string())
            .spawn(move || serve(listener, serve_state))?;

        Ok(Self { addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> MockVmHandle {
        MockVmHandle {
            state: self.state.clone(),
        }
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = self.state.writer.lock().as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        } else {
            // Unblock the accept loop.
            let _ = TcpStream::connect(self.addr);
        }
    }
}

impl MockVmHandle {
    pub fn add_thread(&self, thread: ThreadId, name: &str) {
        self.state.threads.lock().insert(
            thread,
            MockThread {
                name: name.to_string(),
                alive: true,
                ..Default::default()
            },
        );
    }

    /// Adds the thread and emits `ThreadStart` if a request is installed.
    pub fn start_thread(&self, thread: ThreadId, name: &str) {
        self.add_thread(thread, name);
        let matches = self.matching_requests(EVENT_KIND_THREAD_START, |_| true);
        for req in matches {
            self.emit(
                req.suspend_policy,
                Some(thread),
                |w, sizes| {
                    w.write_u8(EVENT_KIND_THREAD_START);
                    w.write_i32(req.request_id);
                    w.write_object_id(thread, sizes);
                },
            );
        }
    }

    pub fn kill_thread(&self, thread: ThreadId) {
        if let Some(t) = self.state.threads.lock().get_mut(&thread) {
            t.alive = false;
        }
        let matches = self.matching_requests(EVENT_KIND_THREAD_DEATH, |_| true);
        for req in matches {
            self.emit(req.suspend_policy, Some(thread), |w, sizes| {
                w.write_u8(EVENT_KIND_THREAD_DEATH);
                w.write_i32(req.request_id);
                w.write_object_id(thread, sizes);
            });
        }
    }

    pub fn add_class(&self, class: MockClass) {
        self.state.classes.lock().insert(class.type_id, class);
    }

    /// Adds the class and emits `ClassPrepare` on `event_thread` for every
    /// matching prepare request, applying each request's suspend policy.
    pub fn load_class(&self, class: MockClass, event_thread: ThreadId) {
        let type_id = class.type_id;
        self.add_class(class);
        let class = self.state.classes.lock().get(&type_id).cloned().unwrap();

        let state = &self.state;
        let matches = self.matching_requests(EVENT_KIND_CLASS_PREPARE, |req| {
            req.modifiers.iter().all(|m| match m {
                MockModifier::ClassMatch { pattern } => class_name_matches(&class.name, pattern),
                MockModifier::ClassOnly { class_id } => {
                    is_same_or_subclass(&state.classes.lock(), type_id, *class_id)
                }
                _ => true,
            })
        });
        for req in matches {
            self.emit(req.suspend_policy, Some(event_thread), |w, sizes| {
                w.write_u8(EVENT_KIND_CLASS_PREPARE);
                w.write_i32(req.request_id);
                w.write_object_id(event_thread, sizes);
                w.write_u8(1); // CLASS
                w.write_reference_type_id(type_id, sizes);
                w.write_string(&class.signature);
                w.write_u32(7); // VERIFIED | PREPARED | INITIALIZED
            });
        }
    }

    /// Removes the class and emits `ClassUnload` if a request is installed.
    pub fn unload_class(&self, type_id: ReferenceTypeId) {
        let Some(class) = self.state.classes.lock().remove(&type_id) else {
            return;
        };
        let matches = self.matching_requests(EVENT_KIND_CLASS_UNLOAD, |_| true);
        for req in matches {
            self.emit(req.suspend_policy, None, |w, _sizes| {
                w.write_u8(EVENT_KIND_CLASS_UNLOAD);
                w.write_i32(req.request_id);
                w.write_string(&class.signature);
            });
        }
    }

    /// Marks the class as garbage collected: commands that reference its id
    /// answer `INVALID_OBJECT` from now on.
    pub fn mark_collected(&self, type_id: ReferenceTypeId) {
        if let Some(class) = self.state.classes.lock().remove(&type_id) {
            self.state.collected.lock().insert(type_id, class.signature);
        } else {
            self.state.collected.lock().insert(type_id, String::new());
        }
    }

    pub fn set_thread_frames(&self, thread: ThreadId, frames: Vec<FrameInfo>) {
        if let Some(t) = self.state.threads.lock().get_mut(&thread) {
            t.frames = frames;
        }
    }

    /// Fires the breakpoint requests matching `location` on `thread`.
    ///
    /// Returns the request ids that matched (empty when no live request
    /// covers the location, e.g. after a `Count` filter expired).
    pub fn hit_breakpoint(&self, thread: ThreadId, location: Location) -> Vec<i32> {
        let matches = self.matching_requests(EVENT_KIND_BREAKPOINT, |req| {
            req.modifiers.iter().all(|m| match m {
                MockModifier::LocationOnly { location: l } => *l == location,
                MockModifier::ThreadOnly { thread: t } => *t == thread,
                _ => true,
            })
        });

        let mut fired = Vec::new();
        for req in matches {
            fired.push(req.request_id);
            self.emit(req.suspend_policy, Some(thread), |w, sizes| {
                w.write_u8(EVENT_KIND_BREAKPOINT);
                w.write_i32(req.request_id);
                w.write_object_id(thread, sizes);
                w.write_location(&location, sizes);
            });
        }
        fired
    }

    pub fn suspend_count(&self, thread: ThreadId) -> u32 {
        self.state
            .threads
            .lock()
            .get(&thread)
            .map(|t| t.suspend_count)
            .unwrap_or(0)
    }

    pub fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.requests.lock().clone()
    }

    pub fn breakpoint_request_count(&self) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.event_kind == EVENT_KIND_BREAKPOINT)
            .count()
    }

    /// Drains the thread reference recorded by a `ClassType.InvokeMethod`
    /// call under `key` — the mock side of the in-VM worker's numbered
    /// thread buffer.
    pub fn take_invoked_thread(&self, key: i64) -> Option<ThreadId> {
        self.state.invoked_threads.lock().remove(&key)
    }

    /// Selects live requests of `event_kind` passing `filter`, consuming one
    /// hit from any `Count` filter (expired requests are removed).
    fn matching_requests(
        &self,
        event_kind: u8,
        filter: impl Fn(&MockEventRequest) -> bool,
    ) -> Vec<MockEventRequest> {
        let mut requests = self.state.requests.lock();
        let mut matched = Vec::new();
        let mut expired = Vec::new();
        for req in requests.iter_mut() {
            if req.event_kind != event_kind || !filter(req) {
                continue;
            }
            if let Some(remaining) = req.remaining.as_mut() {
                if *remaining == 0 {
                    continue;
                }
                *remaining -= 1;
                if *remaining == 0 {
                    expired.push(req.request_id);
                }
            }
            matched.push(req.clone());
        }
        requests.retain(|r| !expired.contains(&r.request_id));
        matched
    }

    fn emit(
        &self,
        suspend_policy: u8,
        event_thread: Option<ThreadId>,
        write_event: impl FnOnce(&mut JdwpWriter, &JdwpIdSizes),
    ) {
        if suspend_policy == SUSPEND_POLICY_EVENT_THREAD {
            if let Some(thread) = event_thread {
                if let Some(t) = self.state.threads.lock().get_mut(&thread) {
                    t.suspend_count += 1;
                }
            }
        }

        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(suspend_policy);
        w.write_u32(1);
        write_event(&mut w, &sizes);

        let id = self.state.next_packet_id.fetch_add(1, Ordering::Relaxed) + 1;
        let packet = encode_command(id, 64, 100, &w.into_vec());
        let mut writer = self.state.writer.lock();
        if let Some(stream) = writer.as_mut() {
            let _ = stream.write_all(&packet).and_then(|_| stream.flush());
        } else {
            debug!("no debugger connected; event dropped");
        }
    }
}

fn class_name_matches(name: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        name == pattern
    }
}

fn is_same_or_subclass(
    classes: &HashMap<ReferenceTypeId, MockClass>,
    mut type_id: ReferenceTypeId,
    ancestor: ReferenceTypeId,
) -> bool {
    loop {
        if type_id == ancestor {
            return true;
        }
        match classes.get(&type_id).and_then(|c| c.superclass) {
            Some(superclass) => type_id = superclass,
            None => return false,
        }
    }
}

fn serve(listener: TcpListener, state: Arc<MockState>) {
    let Ok((mut stream, _peer)) = listener.accept() else {
        return;
    };
    if state.shutdown.load(Ordering::SeqCst) {
        return;
    }

    let mut handshake = [0u8; HANDSHAKE.len()];
    if std::io::Read::read_exact(&mut stream, &mut handshake).is_err() || handshake != *HANDSHAKE {
        return;
    }
    if stream.write_all(HANDSHAKE).is_err() {
        return;
    }

    *state.writer.lock() = Some(stream.try_clone().expect("clone mock stream"));

    loop {
        let packet = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(_) => break,
        };
        let RawPacket::Command {
            id,
            command_set,
            command,
            payload,
        } = packet
        else {
            continue;
        };

        let (error_code, reply) = handle_command(&state, command_set, command, &payload);
        trace!(command_set, command, error_code, "mock vm command");
        let encoded = encode_reply(id, error_code, &reply);
        let mut writer = state.writer.lock();
        if let Some(stream) = writer.as_mut() {
            if stream.write_all(&encoded).and_then(|_| stream.flush()).is_err() {
                break;
            }
        }
    }
}

fn handle_command(
    state: &MockState,
    command_set: u8,
    command: u8,
    payload: &[u8],
) -> (u16, Vec<u8>) {
    let sizes = JdwpIdSizes::default();
    match try_handle_command(state, command_set, command, payload, &sizes) {
        Ok(reply) => (0, reply),
        Err(code) => (code, Vec::new()),
    }
}

/// Command dispatch. Protocol decode failures are folded into
/// `NOT_IMPLEMENTED` — a test that trips this has a bug on the client side.
fn try_handle_command(
    state: &MockState,
    command_set: u8,
    command: u8,
    payload: &[u8],
    sizes: &JdwpIdSizes,
) -> std::result::Result<Vec<u8>, u16> {
    let mut r = JdwpReader::new(payload);
    let mut w = JdwpWriter::new();

    match (command_set, command) {
        // VirtualMachine.ClassesBySignature
        (1, 2) => {
            let signature = r.read_string().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let classes = state.classes.lock();
            let matching: Vec<&MockClass> =
                classes.values().filter(|c| c.signature == signature).collect();
            w.write_u32(matching.len() as u32);
            for class in matching {
                w.write_u8(1); // CLASS
                w.write_reference_type_id(class.type_id, sizes);
                w.write_u32(7);
            }
        }
        // VirtualMachine.AllThreads
        (1, 4) => {
            let threads = state.threads.lock();
            let alive: Vec<ThreadId> = threads
                .iter()
                .filter(|(_, t)| t.alive)
                .map(|(id, _)| *id)
                .collect();
            w.write_u32(alive.len() as u32);
            for id in alive {
                w.write_object_id(id, sizes);
            }
        }
        // VirtualMachine.IDSizes
        (1, 7) => {
            w.write_u32(sizes.field_id as u32);
            w.write_u32(sizes.method_id as u32);
            w.write_u32(sizes.object_id as u32);
            w.write_u32(sizes.reference_type_id as u32);
            w.write_u32(sizes.frame_id as u32);
        }
        // ReferenceType.Signature
        (2, 1) => {
            let type_id = r.read_reference_type_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let class = lookup_class(state, type_id)?;
            w.write_string(&class.signature);
        }
        // ReferenceType.Methods
        (2, 5) => {
            let type_id = r.read_reference_type_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let class = lookup_class(state, type_id)?;
            w.write_u32(class.methods.len() as u32);
            for method in &class.methods {
                w.write_method_id(method.method_id, sizes);
                w.write_string(&method.name);
                w.write_string(&method.signature);
                w.write_u32(0x8); // static
            }
        }
        // ReferenceType.SourceFile
        (2, 7) => {
            let type_id = r.read_reference_type_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let class = lookup_class(state, type_id)?;
            match &class.source_file {
                Some(file) => w.write_string(file),
                None => return Err(ERROR_ABSENT_INFORMATION),
            }
        }
        // ClassType.InvokeMethod: records the thread argument into the
        // numbered buffer and returns the key, like the in-VM worker helper.
        (3, 3) => {
            let _class_id = r.read_reference_type_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let _thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let _method_id = r.read_method_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let arg_count = r.read_u32().map_err(|_| ERROR_NOT_IMPLEMENTED)? as usize;
            let mut arg_thread = None;
            for _ in 0..arg_count {
                match r.read_tagged_value(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)? {
                    JdwpValue::Object { id, .. } => arg_thread = Some(id),
                    _ => {}
                }
            }
            let arg_thread = arg_thread.ok_or(ERROR_NOT_IMPLEMENTED)?;
            if state.collected.lock().contains_key(&arg_thread) {
                return Err(ERROR_INVALID_OBJECT);
            }
            let key = state.next_buffer_key.fetch_add(1, Ordering::Relaxed) + 1;
            state.invoked_threads.lock().insert(key, arg_thread);
            w.write_tagged_value(&JdwpValue::Long(key), sizes);
            w.write_u8(b'L');
            w.write_object_id(0, sizes); // no exception
        }
        // Method.LineTable
        (6, 1) => {
            let type_id = r.read_reference_type_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let method_id = r.read_method_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let class = lookup_class(state, type_id)?;
            let method = class
                .methods
                .iter()
                .find(|m| m.method_id == method_id)
                .ok_or(ERROR_NOT_IMPLEMENTED)?;
            let start = method.line_table.first().map(|e| e.code_index).unwrap_or(0);
            let end = method.line_table.last().map(|e| e.code_index).unwrap_or(0);
            w.write_u64(start);
            w.write_u64(end);
            w.write_u32(method.line_table.len() as u32);
            for entry in &method.line_table {
                w.write_u64(entry.code_index);
                w.write_i32(entry.line);
            }
        }
        // ThreadReference.Name
        (11, 1) => {
            let thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let threads = state.threads.lock();
            let t = threads.get(&thread).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_string(&t.name);
        }
        // ThreadReference.Suspend
        (11, 2) => {
            let thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let mut threads = state.threads.lock();
            let t = threads.get_mut(&thread).ok_or(ERROR_INVALID_OBJECT)?;
            t.suspend_count += 1;
        }
        // ThreadReference.Resume
        (11, 3) => {
            let thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let mut threads = state.threads.lock();
            let t = threads.get_mut(&thread).ok_or(ERROR_INVALID_OBJECT)?;
            t.suspend_count = t.suspend_count.saturating_sub(1);
        }
        // ThreadReference.Frames
        (11, 6) => {
            let thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let start = r.read_i32().map_err(|_| ERROR_NOT_IMPLEMENTED)?.max(0) as usize;
            let length = r.read_i32().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let threads = state.threads.lock();
            let t = threads.get(&thread).ok_or(ERROR_INVALID_OBJECT)?;
            let end = if length < 0 {
                t.frames.len()
            } else {
                (start + length as usize).min(t.frames.len())
            };
            let window = if start < t.frames.len() {
                &t.frames[start..end]
            } else {
                &[]
            };
            w.write_u32(window.len() as u32);
            for frame in window {
                w.write_id(frame.frame_id, sizes.frame_id);
                w.write_location(&frame.location, sizes);
            }
        }
        // ThreadReference.SuspendCount
        (11, 12) => {
            let thread = r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let threads = state.threads.lock();
            let t = threads.get(&thread).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_u32(t.suspend_count);
        }
        // EventRequest.Set
        (15, 1) => {
            let event_kind = r.read_u8().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let suspend_policy = r.read_u8().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let modifier_count = r.read_u32().map_err(|_| ERROR_NOT_IMPLEMENTED)? as usize;
            let mut modifiers = Vec::with_capacity(modifier_count);
            let mut remaining = None;
            for _ in 0..modifier_count {
                let kind = r.read_u8().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
                let modifier = match kind {
                    1 => {
                        let count = r.read_u32().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
                        remaining = Some(count);
                        MockModifier::Count { count }
                    }
                    3 => MockModifier::ThreadOnly {
                        thread: r.read_object_id(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?,
                    },
                    4 => MockModifier::ClassOnly {
                        class_id: r
                            .read_reference_type_id(sizes)
                            .map_err(|_| ERROR_NOT_IMPLEMENTED)?,
                    },
                    5 => MockModifier::ClassMatch {
                        pattern: r.read_string().map_err(|_| ERROR_NOT_IMPLEMENTED)?,
                    },
                    7 => MockModifier::LocationOnly {
                        location: r.read_location(sizes).map_err(|_| ERROR_NOT_IMPLEMENTED)?,
                    },
                    _ => return Err(ERROR_NOT_IMPLEMENTED),
                };
                modifiers.push(modifier);
            }

            // Breakpoint locations on a collected class are rejected the way
            // a real VM rejects stale ids.
            for modifier in &modifiers {
                if let MockModifier::LocationOnly { location } = modifier {
                    if state.collected.lock().contains_key(&location.class_id) {
                        return Err(ERROR_INVALID_OBJECT);
                    }
                }
            }

            let request_id = state.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
            state.requests.lock().push(MockEventRequest {
                request_id,
                event_kind,
                suspend_policy,
                modifiers,
                remaining,
            });
            w.write_i32(request_id);
        }
        // EventRequest.Clear
        (15, 2) => {
            let event_kind = r.read_u8().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            let request_id = r.read_i32().map_err(|_| ERROR_NOT_IMPLEMENTED)?;
            state
                .requests
                .lock()
                .retain(|req| !(req.event_kind == event_kind && req.request_id == request_id));
        }
        // EventRequest.ClearAllBreakpoints
        (15, 3) => {
            state
                .requests
                .lock()
                .retain(|req| req.event_kind != EVENT_KIND_BREAKPOINT);
        }
        _ => return Err(ERROR_NOT_IMPLEMENTED),
    }

    Ok(w.into_vec())
}

fn lookup_class(state: &MockState, type_id: ReferenceTypeId) -> std::result::Result<MockClass, u16> {
    if state.collected.lock().contains_key(&type_id) {
        return Err(ERROR_INVALID_OBJECT);
    }
    state
        .classes
        .lock()
        .get(&type_id)
        .cloned()
        .ok_or(ERROR_INVALID_OBJECT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EventModifier, JdwpClient};
    use crate::types::{EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE};

    fn page_class(type_id: u64, name: &str, source: &str, lines: &[(u64, i32)]) -> MockClass {
        MockClass {
            type_id,
            signature: format!("L{};", name.replace('.', "/")),
            name: name.to_string(),
            source_file: Some(source.to_string()),
            superclass: None,
            methods: vec![MockMethod {
                method_id: 1,
                name: "call".to_string(),
                signature: "()V".to_string(),
                line_table: lines
                    .iter()
                    .map(|&(code_index, line)| LineTableEntry { code_index, line })
                    .collect(),
            }],
        }
    }

    #[test]
    fn thread_start_events_reach_the_event_receiver() {
        let vm = MockVm::spawn().unwrap();
        let (client, events) = JdwpClient::connect(vm.addr()).unwrap();

        client
            .event_request_set(EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE, Vec::new())
            .unwrap();
        vm.handle().start_thread(0x7, "request-7");

        let set = events.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(matches!(
            set.events[0],
            crate::types::JdwpEvent::ThreadStart { thread: 0x7, .. }
        ));
    }

    #[test]
    fn breakpoint_hit_applies_event_thread_suspension_and_count_expiry() {
        let vm = MockVm::spawn().unwrap();
        let (client, _events) = JdwpClient::connect(vm.addr()).unwrap();
        let handle = vm.handle();
        handle.add_thread(0x9, "page-worker");
        handle.add_class(page_class(0x100, "app.page_a", "/srv/a.cf", &[(0, 10)]));

        let location = Location {
            type_tag: 1,
            class_id: 0x100,
            method_id: 1,
            index: 0,
        };
        client
            .event_request_set(
                EVENT_KIND_BREAKPOINT,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    EventModifier::Count { count: 1 },
                    EventModifier::LocationOnly { location },
                ],
            )
            .unwrap();

        assert_eq!(handle.hit_breakpoint(0x9, location).len(), 1);
        assert_eq!(handle.suspend_count(0x9), 1);
        // The count filter expired the request.
        assert!(handle.hit_breakpoint(0x9, location).is_empty());
        assert_eq!(handle.suspend_count(0x9), 1);
    }

    #[test]
    fn collected_classes_answer_invalid_object() {
        let vm = MockVm::spawn().unwrap();
        let (client, _events) = JdwpClient::connect(vm.addr()).unwrap();
        let handle = vm.handle();
        handle.add_class(page_class(0x200, "app.page_b", "/srv/b.cf", &[(0, 3)]));

        assert!(client.reference_type_signature(0x200).is_ok());
        handle.mark_collected(0x200);
        let err = client.reference_type_signature(0x200).unwrap_err();
        assert!(err.is_object_collected());
    }
}
