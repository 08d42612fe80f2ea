use std::{
    collections::HashMap,
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::{
    codec::{encode_command, read_packet, JdwpReader, JdwpWriter, RawPacket, HANDSHAKE},
    types::{
        ClassInfo, EventSet, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes, JdwpValue, LineTable,
        LineTableEntry, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result,
        ThreadId, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE, EVENT_KIND_CLASS_UNLOAD,
        EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH,
        EVENT_KIND_VM_START,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

struct Inner {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u32, mpsc::Sender<std::result::Result<Reply, JdwpError>>>>,
    next_id: AtomicU32,
    id_sizes: RwLock<JdwpIdSizes>,
    shutdown: AtomicBool,
    config: JdwpClientConfig,
}

/// Blocking JDWP client.
///
/// Cloning is cheap; all clones share one connection. Commands may be issued
/// from any thread: the writer is locked per packet and replies are routed
/// back by packet id from the reader thread.
#[derive(Clone)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    /// Connects, performs the handshake, and queries id sizes.
    ///
    /// Returns the client plus the receiver for composite event sets; the
    /// receiver disconnects when the VM closes the connection or
    /// [`JdwpClient::shutdown`] is called.
    pub fn connect(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<EventSet>)> {
        Self::connect_with_config(addr, JdwpClientConfig::default())
    }

    pub fn connect_with_config(
        addr: SocketAddr,
        config: JdwpClientConfig,
    ) -> Result<(Self, mpsc::Receiver<EventSet>)> {
        let mut stream = TcpStream::connect_timeout(&addr, config.handshake_timeout)?;
        stream.set_nodelay(true).ok();

        stream.set_read_timeout(Some(config.handshake_timeout))?;
        stream.write_all(HANDSHAKE)?;
        stream.flush()?;
        let mut reply = [0u8; HANDSHAKE.len()];
        std::io::Read::read_exact(&mut stream, &mut reply)?;
        if reply != *HANDSHAKE {
            return Err(JdwpError::HandshakeFailed);
        }
        // The reader thread blocks on the socket from here on.
        stream.set_read_timeout(None)?;

        let reader_stream = stream.try_clone()?;
        let inner = Arc::new(Inner {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            id_sizes: RwLock::new(JdwpIdSizes::default()),
            shutdown: AtomicBool::new(false),
            config,
        });

        let (events_tx, events_rx) = mpsc::channel();
        let read_inner = inner.clone();
        std::thread::Builder::new()
            .name("cfdbg-jdwp-reader".to_string())
            .spawn(move || read_loop(reader_stream, read_inner, events_tx))
            .map_err(JdwpError::Io)?;

        let client = Self { inner };
        // Id sizes are required to parse nearly every reply and event.
        client.id_sizes_command()?;
        Ok((client, events_rx))
    }

    /// Tears the connection down; pending commands fail with `Disconnected`
    /// and the event receiver disconnects.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let writer = self.inner.writer.lock();
        let _ = writer.shutdown(std::net::Shutdown::Both);
    }

    fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.read()
    }

    fn send_command_raw(&self, command_set: u8, command: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(JdwpError::Disconnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.inner.pending.lock().insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock();
            if let Err(err) = writer.write_all(&packet).and_then(|_| writer.flush()) {
                self.inner.pending.lock().remove(&id);
                return Err(err.into());
            }
        }

        let reply = match rx.recv_timeout(self.inner.config.reply_timeout) {
            Ok(reply) => reply?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.inner.pending.lock().remove(&id);
                return Err(JdwpError::Timeout);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(JdwpError::Disconnected),
        };

        if reply.error_code != 0 {
            return Err(JdwpError::Vm {
                code: reply.error_code,
            });
        }
        Ok(reply.payload)
    }

    fn id_sizes_command(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new())?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.write() = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.AllThreads (1, 4)
    pub fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 4, Vec::new())?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            threads.push(r.read_object_id(&sizes)?);
        }
        Ok(threads)
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec())?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// ReferenceType.Signature (2, 1)
    pub fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 1, w.into_vec())?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.Methods (2, 5)
    pub fn reference_type_methods(&self, class_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 5, w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_method_id(&sizes)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.SourceFile (2, 7)
    pub fn reference_type_source_file(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 7, w.into_vec())?;
        JdwpReader::new(&payload).read_string()
    }

    /// ClassType.InvokeMethod (3, 3)
    ///
    /// Returns the return value and the thrown-exception object id (zero when
    /// the call completed normally).
    pub fn class_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<(JdwpValue, ObjectId)> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_method_id(method_id, &sizes);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(3, 3, w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let value = r.read_tagged_value(&sizes)?;
        let _exception_tag = r.read_u8()?;
        let exception = r.read_object_id(&sizes)?;
        Ok((value, exception))
    }

    /// Method.LineTable (6, 1)
    pub fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_method_id(method_id, &sizes);
        let payload = self.send_command_raw(6, 1, w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            });
        }
        Ok(LineTable { start, end, lines })
    }

    /// ThreadReference.Name (11, 1)
    pub fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let payload = self.send_command_raw(11, 1, w.into_vec())?;
        JdwpReader::new(&payload).read_string()
    }

    /// ThreadReference.Suspend (11, 2)
    pub fn thread_suspend(&self, thread: ThreadId) -> Result<()> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let _ = self.send_command_raw(11, 2, w.into_vec())?;
        Ok(())
    }

    /// ThreadReference.Resume (11, 3)
    ///
    /// Decrements the suspend count by one; the thread runs only when the
    /// count reaches zero.
    pub fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let _ = self.send_command_raw(11, 3, w.into_vec())?;
        Ok(())
    }

    /// ThreadReference.Frames (11, 6)
    pub fn thread_frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_frame_id(&sizes)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// ThreadReference.SuspendCount (11, 12)
    pub fn thread_suspend_count(&self, thread: ThreadId) -> Result<u32> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let payload = self.send_command_raw(11, 12, w.into_vec())?;
        JdwpReader::new(&payload).read_u32()
    }

    /// EventRequest.Set (15, 1)
    ///
    /// The request is live as soon as the VM replies; there is no separate
    /// enable step on the wire.
    pub fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec())?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        let _ = self.send_command_raw(15, 2, w.into_vec())?;
        Ok(())
    }

    /// EventRequest.ClearAllBreakpoints (15, 3)
    pub fn clear_all_breakpoints(&self) -> Result<()> {
        let _ = self.send_command_raw(15, 3, Vec::new())?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum EventModifier {
    Count { count: u32 },
    ThreadOnly { thread: ThreadId },
    ClassOnly { class_id: ReferenceTypeId },
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(1);
                w.write_u32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(3);
                w.write_object_id(thread, sizes);
            }
            EventModifier::ClassOnly { class_id } => {
                w.write_u8(4);
                w.write_reference_type_id(class_id, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(5);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(7);
                w.write_location(&location, sizes);
            }
        }
    }
}

fn read_loop(mut stream: TcpStream, inner: Arc<Inner>, events_tx: mpsc::Sender<EventSet>) {
    loop {
        let packet = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(err) => {
                if !inner.shutdown.load(Ordering::SeqCst) {
                    debug!(error = %err, "jdwp connection closed");
                }
                break;
            }
        };

        match packet {
            RawPacket::Reply {
                id,
                error_code,
                payload,
            } => {
                let tx = inner.pending.lock().remove(&id);
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(Reply {
                        error_code,
                        payload,
                    }));
                } else {
                    trace!(id, "reply for unknown packet id");
                }
            }
            RawPacket::Command {
                command_set,
                command,
                payload,
                ..
            } => {
                if command_set == 64 && command == 100 {
                    let sizes = *inner.id_sizes.read();
                    match parse_event_set(&payload, &sizes) {
                        Ok(set) => {
                            if events_tx.send(set).is_err() {
                                // Event pump is gone; nothing left to serve.
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "undecodable composite event packet");
                            break;
                        }
                    }
                } else {
                    // The VM sends no other debugger-bound commands we care about.
                    trace!(command_set, command, "ignoring VM command packet");
                }
            }
        }
    }

    inner.shutdown.store(true, Ordering::SeqCst);
    let pending = std::mem::take(&mut *inner.pending.lock());
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::Disconnected));
    }
}

fn parse_event_set(payload: &[u8], sizes: &JdwpIdSizes) -> Result<EventSet> {
    let mut r = JdwpReader::new(payload);
    let suspend_policy = r.read_u8()?;
    let count = r.read_u32()? as usize;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
            },
            EVENT_KIND_THREAD_START => JdwpEvent::ThreadStart {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            EVENT_KIND_THREAD_DEATH => JdwpEvent::ThreadDeath {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_CLASS_UNLOAD => JdwpEvent::ClassUnload {
                request_id,
                signature: r.read_string()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath,
            other => {
                // We cannot know this event's payload layout, so the rest of
                // the composite packet is undecodable. Hand the kind up and
                // let the consumer apply its policy.
                events.push(JdwpEvent::Unknown { kind: other });
                return Ok(EventSet {
                    suspend_policy,
                    events,
                });
            }
        };
        events.push(event);
    }
    Ok(EventSet {
        suspend_policy,
        events,
    })
}
