use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FrameId = u64;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_THREAD_START: u8 = 6;
pub const EVENT_KIND_THREAD_DEATH: u8 = 7;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_CLASS_UNLOAD: u8 = 9;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

/// JDWP error code for an object id whose referent has been garbage
/// collected. The wire-level equivalent of JDI's `ObjectCollectedException`.
pub const ERROR_INVALID_OBJECT: u16 = 20;

/// `ReferenceType.SourceFile` answers this when the class was compiled
/// without source attribution.
pub const ERROR_ABSENT_INFORMATION: u16 = 101;

/// `ClassType.InvokeMethod` option: resume only the invoking thread while the
/// call runs, leaving every other suspension in place.
pub const INVOKE_SINGLE_THREADED: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        // Most modern VMs use 8 byte ids; the real sizes are queried right
        // after the handshake and overwrite these.
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    /// A `java.lang.Thread` reference, as passed to `ClassType.InvokeMethod`.
    pub fn thread(id: ThreadId) -> Self {
        JdwpValue::Object { tag: b't', id }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            JdwpValue::Long(v) => Some(*v),
            _ => None,
        }
    }
}

/// One event out of a composite `Event.Composite` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JdwpEvent {
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    ClassUnload {
        request_id: i32,
        signature: String,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
    /// An event kind this client does not decode. The remainder of the
    /// composite packet is discarded; consumers decide whether that is fatal.
    Unknown { kind: u8 },
}

/// A composite event packet: the events plus the suspend policy the VM
/// applied when it emitted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JDWP handshake failed")]
    HandshakeFailed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("VM returned error code {code}")]
    Vm { code: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Disconnected,

    #[error("JDWP string was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl JdwpError {
    /// True when the VM rejected the command because the referenced object
    /// has been garbage collected.
    pub fn is_object_collected(&self) -> bool {
        matches!(self, JdwpError::Vm { code: ERROR_INVALID_OBJECT })
    }

    pub fn is_absent_information(&self) -> bool {
        matches!(self, JdwpError::Vm { code: ERROR_ABSENT_INFORMATION })
    }
}

pub type Result<T> = std::result::Result<T, JdwpError>;
