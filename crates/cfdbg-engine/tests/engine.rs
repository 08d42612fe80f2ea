//! End-to-end engine tests against the mock wire VM.
//!
//! Each test boots a full engine (worker bootstrap included) against a
//! [`cfdbg_jdwp::mock::MockVm`], with a scripted debug manager and worker
//! bridge standing in for the injected agent side.

mod harness {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use once_cell::sync::Lazy;
    use parking_lot::Mutex;

    use cfdbg_engine::{
        BreakpointsChangedEvent, CfStepHandler, CfStepKind, CfVm, DapBreakpointId, DebugEntity,
        DebugEntityKind, DebugFrame, DebugManager, DwpThreadId, EngineConfig, EvalResult,
        NativeThread, WorkerBridge,
    };
    use cfdbg_jdwp::mock::{MockClass, MockMethod, MockVm, MockVmHandle};
    use cfdbg_jdwp::{LineTableEntry, Location};

    pub const WORKER_CLASS_ID: u64 = 0x90;
    pub const WORKER_PARK_METHOD: u64 = 1;
    pub const WORKER_GET_THREAD_METHOD: u64 = 2;
    pub const WORKER_THREAD: u64 = 0x900;
    pub const BASE_CLASS_ID: u64 = 0x50;
    pub const RUNTIME_CLASS_ID: u64 = 0x300;
    pub const STEP_ENTRY_METHOD: u64 = 7;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });

    pub fn loc(class_id: u64, method_id: u64, index: u64) -> Location {
        Location {
            type_tag: 1,
            class_id,
            method_id,
            index,
        }
    }

    pub fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// A compiled page class: single `call` method, sparse line table,
    /// derived from the base page class.
    pub fn page_class(type_id: u64, name: &str, source: &str, lines: &[(u64, i32)]) -> MockClass {
        MockClass {
            type_id,
            signature: format!("L{};", name.replace('.', "/")),
            name: name.to_string(),
            source_file: Some(source.to_string()),
            superclass: Some(BASE_CLASS_ID),
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

    pub fn base_page_class() -> MockClass {
        MockClass {
            type_id: BASE_CLASS_ID,
            signature: "Lcfml/runtime/Page;".to_string(),
            name: "cfml.runtime.Page".to_string(),
            source_file: None,
            superclass: None,
            methods: Vec::new(),
        }
    }

    fn worker_class() -> MockClass {
        MockClass {
            type_id: WORKER_CLASS_ID,
            signature: "Lcfdbg/agent/Worker;".to_string(),
            name: "cfdbg.agent.Worker".to_string(),
            source_file: None,
            superclass: None,
            methods: vec![
                MockMethod {
                    method_id: WORKER_PARK_METHOD,
                    name: "parkForDebuggerSuspend".to_string(),
                    signature: "()V".to_string(),
                    line_table: Vec::new(),
                },
                MockMethod {
                    method_id: WORKER_GET_THREAD_METHOD,
                    name: "bufferThreadForDebugger".to_string(),
                    signature: "(Ljava/lang/Thread;)J".to_string(),
                    line_table: Vec::new(),
                },
            ],
        }
    }

    /// The runtime class owning the step-notification entry function, for
    /// the finalizer's frame walk.
    fn runtime_class() -> MockClass {
        MockClass {
            type_id: RUNTIME_CLASS_ID,
            signature: "Lcfml/runtime/StepNotify;".to_string(),
            name: "cfml.runtime.StepNotify".to_string(),
            source_file: None,
            superclass: None,
            methods: vec![MockMethod {
                method_id: STEP_ENTRY_METHOD,
                name: "stepNotificationEntry".to_string(),
                signature: "()V".to_string(),
                line_table: Vec::new(),
            }],
        }
    }

    /// Scripted stand-in for the in-VM variable/stepping subsystem.
    #[derive(Default)]
    pub struct TestDebugManager {
        handler: Mutex<Option<CfStepHandler>>,
        pub step_requests: Mutex<Vec<(u64, CfStepKind)>>,
        pub cleared_steps: Mutex<Vec<u64>>,
        pub condition_results: Mutex<HashMap<String, bool>>,
    }

    impl TestDebugManager {
        pub fn handler(&self) -> CfStepHandler {
            self.handler.lock().clone().expect("step handler registered")
        }

        pub fn set_condition(&self, expr: &str, result: bool) {
            self.condition_results.lock().insert(expr.to_string(), result);
        }
    }

    impl DebugManager for TestDebugManager {
        fn get_cf_stack(&self, thread: &Arc<NativeThread>) -> Vec<DebugFrame> {
            vec![DebugFrame {
                id: thread.object_id,
                name: "call".to_string(),
                source_path: "/srv/a.cf".to_string(),
                line: 10,
            }]
        }

        fn get_scopes_for_frame(&self, _frame_id: u64) -> Vec<DebugEntity> {
            vec![DebugEntity {
                name: "Local".to_string(),
                value: String::new(),
                variables_reference: 7,
                named_variables: 0,
                indexed_variables: 0,
            }]
        }

        fn get_variables(&self, _id: i64, _kind: Option<DebugEntityKind>) -> Vec<DebugEntity> {
            Vec::new()
        }

        fn register_cf_step_handler(&self, handler: CfStepHandler) {
            *self.handler.lock() = Some(handler);
        }

        fn register_step_request(&self, thread: &Arc<NativeThread>, kind: CfStepKind) {
            self.step_requests.lock().push((thread.object_id, kind));
        }

        fn clear_step_request(&self, thread: &Arc<NativeThread>) {
            self.cleared_steps.lock().push(thread.object_id);
        }

        fn evaluate_as_boolean_for_conditional_breakpoint(
            &self,
            _thread: &Arc<NativeThread>,
            expr: &str,
        ) -> bool {
            self.condition_results.lock().get(expr).copied().unwrap_or(true)
        }

        fn is_step_notification_entry(&self, method_name: &str) -> bool {
            method_name == "stepNotificationEntry"
        }

        fn do_dump(&self, suspended_threads: &[Arc<NativeThread>], variables_ref: i64) -> String {
            format!("dump({variables_ref}) over {} threads", suspended_threads.len())
        }

        fn do_dump_as_json(
            &self,
            _suspended_threads: &[Arc<NativeThread>],
            variables_ref: i64,
        ) -> String {
            format!("{{\"ref\":{variables_ref}}}")
        }

        fn get_source_path_for_variables_ref(&self, _variables_ref: i64) -> String {
            "/srv/a.cf".to_string()
        }

        fn evaluate(&self, _frame_id: u64, expr: &str) -> Result<EvalResult, String> {
            if expr == "boom" {
                Err("no such variable".to_string())
            } else {
                Ok(EvalResult::Textual(format!("eval:{expr}")))
            }
        }
    }

    /// Agent-side worker bridge over the mock VM's invocation buffer.
    pub struct TestWorkerBridge {
        handle: MockVmHandle,
        threads: Mutex<HashMap<u64, Arc<NativeThread>>>,
    }

    impl TestWorkerBridge {
        pub fn new(handle: MockVmHandle) -> Self {
            Self {
                handle,
                threads: Mutex::new(HashMap::new()),
            }
        }

        /// The strong handle the agent holds for a tracked thread.
        pub fn native_for(&self, object_id: u64) -> Arc<NativeThread> {
            self.threads
                .lock()
                .get(&object_id)
                .cloned()
                .expect("thread tracked through the worker")
        }

        /// Simulates collection of the native thread: the agent drops its
        /// strong handle, leaving only the registry's weak one.
        pub fn drop_thread(&self, object_id: u64) {
            self.threads.lock().remove(&object_id);
        }
    }

    impl WorkerBridge for TestWorkerBridge {
        fn spawn_worker_thread(&self) {
            self.handle.start_thread(WORKER_THREAD, "cfdbg-worker");
            self.handle
                .hit_breakpoint(WORKER_THREAD, loc(WORKER_CLASS_ID, WORKER_PARK_METHOD, 0));
        }

        fn take_thread(&self, key: i64) -> Option<Arc<NativeThread>> {
            let object_id = self.handle.take_invoked_thread(key)?;
            let mut threads = self.threads.lock();
            if let Some(existing) = threads.get(&object_id) {
                return Some(existing.clone());
            }
            let native = Arc::new(NativeThread {
                buffer_key: key,
                object_id,
            });
            threads.insert(object_id, native.clone());
            Some(native)
        }
    }

    /// Callback recordings, appended from the engine's pump thread.
    #[derive(Default)]
    pub struct Recorded {
        pub steps: Mutex<Vec<DwpThreadId>>,
        pub breakpoints: Mutex<Vec<(DwpThreadId, DapBreakpointId)>>,
        pub changed: Mutex<Vec<BreakpointsChangedEvent>>,
    }

    pub struct TestVm {
        pub mock: MockVm,
        pub handle: MockVmHandle,
        pub manager: Arc<TestDebugManager>,
        pub bridge: Arc<TestWorkerBridge>,
        pub recorded: Arc<Recorded>,
        pub config: EngineConfig,
        pub vm: CfVm,
    }

    impl TestVm {
        pub fn boot(base_class_loaded: bool) -> anyhow::Result<TestVm> {
            Lazy::force(&TRACING);

            let mock = MockVm::spawn()?;
            let handle = mock.handle();
            handle.add_class(worker_class());
            handle.add_class(runtime_class());
            if base_class_loaded {
                handle.add_class(base_page_class());
            }

            let mut config = EngineConfig::default();
            config.fs_case_sensitive = true;

            let manager = Arc::new(TestDebugManager::default());
            let bridge = Arc::new(TestWorkerBridge::new(handle.clone()));
            let vm = CfVm::attach(mock.addr(), config.clone(), manager.clone(), bridge.clone())?;

            let recorded = Arc::new(Recorded::default());
            let r = recorded.clone();
            vm.register_step_event_callback(Arc::new(move |thread| {
                r.steps.lock().push(thread);
            }));
            let r = recorded.clone();
            vm.register_breakpoint_event_callback(Arc::new(move |thread, id| {
                r.breakpoints.lock().push((thread, id));
            }));
            let r = recorded.clone();
            vm.register_breakpoints_changed_callback(Arc::new(move |event| {
                r.changed.lock().push(event);
            }));

            Ok(TestVm {
                mock,
                handle,
                manager,
                bridge,
                recorded,
                config,
                vm,
            })
        }

        /// Starts a thread in the mock and waits for the engine to track it
        /// through the worker.
        pub fn start_tracked_thread(&self, object_id: u64, name: &str) {
            self.handle.start_thread(object_id, name);
            let vm = &self.vm;
            wait_until("thread to be tracked", || {
                vm.thread_listing()
                    .iter()
                    .any(|(id, _)| *id == DwpThreadId(object_id))
            });
        }

        /// Loads a page class with `event_thread` as the preparing thread and
        /// waits for the engine to process the prepare and resume it.
        pub fn load_page_class(&self, class: MockClass, event_thread: u64) {
            self.handle.load_class(class, event_thread);
            let handle = &self.handle;
            wait_until("class prepare to be processed", || {
                handle.suspend_count(event_thread) == 0
            });
        }
    }
}

use harness::*;

use cfdbg_engine::{CfStepKind, DwpThreadId, EngineError, EvalResult, RawIdePath};

#[test]
fn preload_bind_then_class_prepare_rebinds_known_lines() {
    let t = TestVm::boot(true).unwrap();
    let ide = RawIdePath::new("/a.cf");
    let server = t.config.canonicalize("/srv/a.cf");

    // No class for the path yet: both lines come back unbound, fresh ids.
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[10, 20], &[None, None])
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(!results[0].bound && !results[1].bound);
    assert_ne!(results[0].id, results[1].id);
    let (i1, i2) = (results[0].id, results[1].id);

    // The class prepares with line 10 in its table, line 20 absent.
    t.start_tracked_thread(0x11, "page-thread");
    t.load_page_class(page_class(0x100, "app.a_cf", "/srv/a.cf", &[(0, 10)]), 0x11);

    let recorded = &t.recorded;
    wait_until("breakpoints-changed event", || {
        !recorded.changed.lock().is_empty()
    });
    let changed = recorded.changed.lock().clone();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].changed.len(), 1);
    let bp = changed[0].changed[0];
    assert_eq!(bp.line, 10);
    assert_eq!(bp.id, i1);
    assert!(bp.bound);

    // Line 20 still has its record, unbound, same id.
    let detail = t.vm.breakpoint_detail();
    assert!(detail.iter().any(|(_, s)| s == "/srv/a.cf:20 (unbound)"));
    assert!(detail.iter().any(|(_, s)| s == "/srv/a.cf:10 (bound)"));
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[20], &[None])
        .unwrap();
    assert_eq!(results[0].id, i2);
}

#[test]
fn falsy_conditional_breakpoint_resumes_silently() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x21, "page-thread");
    t.load_page_class(page_class(0x100, "app.x_cf", "/srv/x.cf", &[(0, 5)]), 0x21);

    t.manager.set_condition("false", false);
    let ide = RawIdePath::new("/x.cf");
    let server = t.config.canonicalize("/srv/x.cf");
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[5], &[Some("false".to_string())])
        .unwrap();
    assert!(results[0].bound);

    let fired = t.handle.hit_breakpoint(0x21, loc(0x100, 1, 0));
    assert_eq!(fired.len(), 1);

    // The engine evaluates the condition, finds it falsy, and resumes the
    // thread without surfacing anything.
    let handle = &t.handle;
    wait_until("thread resumed after suppressed hit", || {
        handle.suspend_count(0x21) == 0
    });
    assert!(t.recorded.breakpoints.lock().is_empty());
}

#[test]
fn step_over_installs_one_shot_and_fires_step_event_once() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x31, "page-thread");
    t.load_page_class(page_class(0x100, "app.s_cf", "/srv/s.cf", &[(10, 5)]), 0x31);

    let ide = RawIdePath::new("/s.cf");
    let server = t.config.canonicalize("/srv/s.cf");
    t.vm
        .bind_breakpoints(&ide, &server, &[5], &[None])
        .unwrap();

    // Suspend on the user breakpoint first.
    t.handle.hit_breakpoint(0x31, loc(0x100, 1, 10));
    let recorded = &t.recorded;
    wait_until("breakpoint event", || !recorded.breakpoints.lock().is_empty());
    assert_eq!(t.handle.suspend_count(0x31), 1);

    t.vm.step_over(DwpThreadId(0x31));
    assert_eq!(
        t.manager.step_requests.lock().as_slice(),
        &[(0x31, CfStepKind::StepOver)]
    );
    let handle = &t.handle;
    wait_until("thread resumed for step", || handle.suspend_count(0x31) == 0);

    // The dispatch edge arrives: the manager invokes the engine's handler on
    // the stepping thread. Frame 0 is the notification entry, frame 1 the CF
    // frame parked on its invoke instruction.
    t.handle.set_thread_frames(
        0x31,
        vec![
            cfdbg_jdwp::FrameInfo {
                frame_id: 1,
                location: loc(RUNTIME_CLASS_ID, STEP_ENTRY_METHOD, 0),
            },
            cfdbg_jdwp::FrameInfo {
                frame_id: 2,
                location: loc(0x100, 1, 10),
            },
        ],
    );
    let handler = t.manager.handler();
    (*handler)(t.bridge.native_for(0x31), 0);

    wait_until("finalizer resumed the thread", || {
        handle.suspend_count(0x31) == 0
    });

    // One-shot breakpoint sits exactly one invoke-interface instruction
    // (5 bytes) past the CF frame's code index.
    let fired = t.handle.hit_breakpoint(0x31, loc(0x100, 1, 15));
    assert_eq!(fired.len(), 1);

    wait_until("step event", || !recorded.steps.lock().is_empty());
    assert_eq!(recorded.steps.lock().as_slice(), &[DwpThreadId(0x31)]);
    // No breakpoint event for the finalization hit, and the one-shot has
    // auto-expired.
    assert_eq!(recorded.breakpoints.lock().len(), 1);
    assert!(t.handle.hit_breakpoint(0x31, loc(0x100, 1, 15)).is_empty());
}

#[test]
fn user_breakpoint_cancels_armed_step() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x41, "page-thread");
    t.load_page_class(
        page_class(0x100, "app.c_cf", "/srv/c.cf", &[(0, 5), (20, 9)]),
        0x41,
    );

    let ide = RawIdePath::new("/c.cf");
    let server = t.config.canonicalize("/srv/c.cf");
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[5, 9], &[None, None])
        .unwrap();
    let line9_id = results[1].id;

    t.handle.hit_breakpoint(0x41, loc(0x100, 1, 0));
    let recorded = &t.recorded;
    wait_until("first breakpoint event", || {
        !recorded.breakpoints.lock().is_empty()
    });

    t.vm.step_over(DwpThreadId(0x41));
    let handle = &t.handle;
    wait_until("thread resumed for step", || handle.suspend_count(0x41) == 0);

    // Another user breakpoint fires before finalization ever happens.
    t.handle.hit_breakpoint(0x41, loc(0x100, 1, 20));

    let manager = &t.manager;
    wait_until("step request cleared", || {
        manager.cleared_steps.lock().as_slice() == [0x41]
    });
    wait_until("second breakpoint event", || {
        recorded.breakpoints.lock().len() == 2
    });
    assert_eq!(
        recorded.breakpoints.lock()[1],
        (DwpThreadId(0x41), line9_id)
    );
    assert!(recorded.steps.lock().is_empty());

    // The cycle is over: a fresh step arms again rather than being swallowed
    // by leftover state.
    t.handle.hit_breakpoint(0x41, loc(0x100, 1, 0));
    wait_until("third breakpoint event", || {
        recorded.breakpoints.lock().len() == 3
    });
    t.vm.step_over(DwpThreadId(0x41));
    assert_eq!(t.manager.step_requests.lock().len(), 2);
}

#[test]
fn continue_all_resumes_every_suspended_thread() {
    let t = TestVm::boot(true).unwrap();
    for (object_id, name) in [(0x51, "t1"), (0x52, "t2"), (0x53, "t3")] {
        t.start_tracked_thread(object_id, name);
    }
    t.load_page_class(page_class(0x100, "app.m_cf", "/srv/m.cf", &[(0, 5)]), 0x51);

    let ide = RawIdePath::new("/m.cf");
    let server = t.config.canonicalize("/srv/m.cf");
    t.vm
        .bind_breakpoints(&ide, &server, &[5], &[None])
        .unwrap();

    for object_id in [0x51, 0x52, 0x53] {
        t.handle.hit_breakpoint(object_id, loc(0x100, 1, 0));
    }
    let recorded = &t.recorded;
    wait_until("three breakpoint events", || {
        recorded.breakpoints.lock().len() == 3
    });
    for object_id in [0x51u64, 0x52, 0x53] {
        assert_eq!(t.handle.suspend_count(object_id), 1);
    }

    t.vm.continue_all();
    let handle = &t.handle;
    wait_until("all threads resumed", || {
        [0x51u64, 0x52, 0x53]
            .iter()
            .all(|&id| handle.suspend_count(id) == 0)
    });

    // Idempotent on an empty suspended set.
    t.vm.continue_all();
}

#[test]
fn collected_mirror_is_pruned_and_remaining_mirror_binds() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x61, "page-thread");
    // Two mappings of the same source file, distinct classes.
    t.load_page_class(page_class(0x100, "app.a_cf", "/srv/a.cf", &[(0, 10)]), 0x61);
    t.load_page_class(
        page_class(0x101, "mapped.a_cf", "/srv/a.cf", &[(4, 10)]),
        0x61,
    );
    assert_eq!(t.vm.tracked_canonical_file_names().len(), 2);

    t.handle.mark_collected(0x100);

    let ide = RawIdePath::new("/a.cf");
    let server = t.config.canonicalize("/srv/a.cf");
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[10], &[None])
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].bound);

    // The dead mirror is gone; the survivor carries the binding.
    assert_eq!(t.vm.tracked_canonical_file_names().len(), 1);
    let fired = t.handle.hit_breakpoint(0x61, loc(0x101, 1, 4));
    assert_eq!(fired.len(), 1);
    let recorded = &t.recorded;
    wait_until("breakpoint event from surviving mirror", || {
        !recorded.breakpoints.lock().is_empty()
    });
    assert_eq!(recorded.breakpoints.lock()[0].1, results[0].id);
}

#[test]
fn set_clear_set_round_trip_keeps_ids_and_order() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x71, "page-thread");
    t.load_page_class(
        page_class(0x100, "app.r_cf", "/srv/r.cf", &[(0, 10), (8, 30)]),
        0x71,
    );

    let ide = RawIdePath::new("/r.cf");
    let server = t.config.canonicalize("/srv/r.cf");
    let first = t
        .vm
        .bind_breakpoints(&ide, &server, &[10, 20, 30], &[None, None, None])
        .unwrap();
    // One result per input line, input order.
    assert_eq!(
        first.iter().map(|b| b.line).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
    assert_eq!(
        first.iter().map(|b| b.bound).collect::<Vec<_>>(),
        vec![true, false, true]
    );

    t.vm.clear_all_breakpoints();
    // Zero breakpoint requests left on the VM (the worker's park breakpoint
    // has long since served its one purpose).
    assert_eq!(t.handle.breakpoint_request_count(), 0);
    assert!(t.vm.breakpoint_detail().is_empty());

    let second = t
        .vm
        .bind_breakpoints(&ide, &server, &[10, 20, 30], &[None, None, None])
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn rebinding_the_same_lines_is_idempotent_on_the_vm() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0x81, "page-thread");
    t.load_page_class(page_class(0x100, "app.i_cf", "/srv/i.cf", &[(0, 10)]), 0x81);

    let ide = RawIdePath::new("/i.cf");
    let server = t.config.canonicalize("/srv/i.cf");

    for _ in 0..3 {
        let results = t
            .vm
            .bind_breakpoints(&ide, &server, &[10], &[None])
            .unwrap();
        assert!(results[0].bound);
        // One live request per bound line, however often we re-set. The
        // worker park request expired at bootstrap, so the count is exact.
        assert_eq!(t.handle.breakpoint_request_count(), 1);
    }
}

#[test]
fn base_class_bootstrap_swaps_one_shot_for_subclass_tracking() {
    // Base page class not loaded at attach: the engine parks a one-shot
    // name-filtered prepare request.
    let t = TestVm::boot(false).unwrap();
    let ide = RawIdePath::new("/a.cf");
    let server = t.config.canonicalize("/srv/a.cf");
    let results = t
        .vm
        .bind_breakpoints(&ide, &server, &[10], &[None])
        .unwrap();
    assert!(!results[0].bound);

    t.start_tracked_thread(0x91, "startup-thread");

    // The base class itself prepares: the engine must swap in subclass
    // tracking and resume the preparing thread.
    t.load_page_class(base_page_class(), 0x91);

    // A page subclass prepares next and the pending breakpoint binds.
    t.load_page_class(page_class(0x100, "app.a_cf", "/srv/a.cf", &[(0, 10)]), 0x91);
    let recorded = &t.recorded;
    wait_until("pending breakpoint bound after bootstrap", || {
        recorded
            .changed
            .lock()
            .iter()
            .any(|e| e.changed.iter().any(|b| b.line == 10 && b.bound))
    });
}

#[test]
fn class_unload_reverts_records_to_unbound_and_reload_rebinds() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0xa1, "page-thread");
    t.load_page_class(page_class(0x100, "app.u_cf", "/srv/u.cf", &[(0, 10)]), 0xa1);

    let ide = RawIdePath::new("/u.cf");
    let server = t.config.canonicalize("/srv/u.cf");
    let first = t
        .vm
        .bind_breakpoints(&ide, &server, &[10], &[None])
        .unwrap();
    assert!(first[0].bound);

    t.handle.unload_class(0x100);
    let vm = &t.vm;
    wait_until("record reverted to unbound", || {
        vm.breakpoint_detail()
            .iter()
            .any(|(_, s)| s == "/srv/u.cf:10 (unbound)")
    });
    assert_eq!(t.handle.breakpoint_request_count(), 0);
    assert!(t.vm.tracked_canonical_file_names().is_empty());

    // The page compiles again (a fresh class): same breakpoint, same id,
    // bound once more.
    t.load_page_class(page_class(0x102, "app.u_cf", "/srv/u.cf", &[(6, 10)]), 0xa1);
    let recorded = &t.recorded;
    wait_until("rebound after reload", || {
        recorded
            .changed
            .lock()
            .iter()
            .any(|e| e.changed.iter().any(|b| b.bound && b.id == first[0].id))
    });
}

#[test]
fn dead_threads_fall_out_of_the_listing() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0xb1, "short-lived");
    assert!(t
        .vm
        .thread_listing()
        .iter()
        .any(|(id, name)| *id == DwpThreadId(0xb1) && name == "short-lived"));

    t.bridge.drop_thread(0xb1);
    t.handle.kill_thread(0xb1);
    let vm = &t.vm;
    wait_until("thread pruned from registry", || {
        !vm.thread_listing()
            .iter()
            .any(|(id, _)| *id == DwpThreadId(0xb1))
    });
}

#[test]
fn facade_delegates_inspection_to_the_debug_manager() {
    let t = TestVm::boot(true).unwrap();
    t.start_tracked_thread(0xc1, "page-thread");

    let stack = t.vm.stack_trace(DwpThreadId(0xc1));
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].source_path, "/srv/a.cf");
    // Frames serialize directly into the DAP response shape.
    let frame_json = serde_json::to_value(&stack[0]).unwrap();
    assert_eq!(frame_json["line"], 10);
    assert_eq!(frame_json["name"], "call");

    let scopes = t.vm.scopes(stack[0].id);
    assert_eq!(scopes[0].variables_reference, 7);
    assert!(t.vm.variables(7).is_empty());
    assert!(t.vm.named_variables(7).is_empty());
    assert!(t.vm.indexed_variables(7).is_empty());

    match t.vm.evaluate(1, "now()") {
        Ok(EvalResult::Textual(text)) => assert_eq!(text, "eval:now()"),
        other => panic!("unexpected evaluation result: {other:?}"),
    }
    match t.vm.evaluate(1, "boom") {
        Err(EngineError::Evaluation(message)) => assert_eq!(message, "no such variable"),
        other => panic!("expected evaluation error, got {other:?}"),
    }

    assert_eq!(t.vm.get_source_path_for_variables_ref(7), "/srv/a.cf");
    assert_eq!(t.vm.dump(7), "dump(7) over 0 threads");
    assert_eq!(t.vm.dump_as_json(7), "{\"ref\":7}");

    // Mismatched lines/conditions is a caller error, not a crash.
    let server = t.config.canonicalize("/srv/a.cf");
    let err = t
        .vm
        .bind_breakpoints(&RawIdePath::new("/a.cf"), &server, &[1, 2], &[None])
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}
