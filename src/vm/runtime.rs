//! Shared runtime state and the per-thread execution context.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use super::error::{Trace, VmError};
use super::heap::{Handle, Heap};
use super::program::{Method, Program};
use super::stack::{OperandStack, StackStorage};
use super::threads::ThreadRegistry;
use crate::config::{OnFault, RuntimeConfig};
#[cfg(feature = "jit")]
use crate::jit::PageManager;

/// Frames allocated whenever the pool runs dry.
const FRAME_POOL_BATCH: usize = 64;

/// One activation record.
pub struct Frame {
    pub method: Option<Arc<Method>>,
    /// Interpreter locals: word 0 is the instance, locals start at word 1.
    pub mem: Vec<i64>,
    /// Instruction pointer of the next instruction, saved across calls.
    pub ip: usize,
    /// Native locals region published by compiled code.
    pub jit_mem: *mut i64,
    pub jit_words: i64,
}

impl Frame {
    fn empty() -> Self {
        Self {
            method: None,
            mem: Vec::new(),
            ip: 0,
            jit_mem: std::ptr::null_mut(),
            jit_words: 0,
        }
    }

    pub fn instance(&self) -> Handle {
        self.mem.first().copied().unwrap_or(0) as Handle
    }
}

// Frames only carry raw pointers into memory owned by the thread that uses
// them; pooled frames are reset before they cross threads.
unsafe impl Send for Frame {}

/// Free list of reusable frames shared by all threads.
#[derive(Default)]
pub struct FramePool {
    free: Mutex<Vec<Frame>>,
}

impl FramePool {
    pub fn acquire(&self, method: &Arc<Method>, instance: Handle) -> Frame {
        let mut frame = {
            let mut free = self.free.lock();
            if free.is_empty() {
                free.extend((0..FRAME_POOL_BATCH).map(|_| Frame::empty()));
            }
            free.pop().unwrap_or_else(Frame::empty)
        };
        frame.mem.resize(method.local_words + 1, 0);
        frame.mem[0] = instance as i64;
        frame.method = Some(Arc::clone(method));
        frame
    }

    pub fn release(&self, mut frame: Frame) {
        frame.method = None;
        frame.mem.clear();
        frame.ip = 0;
        frame.jit_mem = std::ptr::null_mut();
        frame.jit_words = 0;
        self.free.lock().push(frame);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Process-wide state constructed once per loaded program.
pub struct Runtime {
    program: Program,
    heap: Heap,
    config: RuntimeConfig,
    class_mem: Vec<usize>,
    frames: FramePool,
    threads: ThreadRegistry,
    bindings: Mutex<HashMap<(usize, usize, usize), Arc<Method>>>,
    #[cfg(feature = "jit")]
    pages: Mutex<PageManager>,
    output: Mutex<Box<dyn Write + Send>>,
    rng: Mutex<u64>,
    halted: AtomicBool,
}

impl Runtime {
    pub fn new(program: Program, config: RuntimeConfig) -> Result<Arc<Self>, VmError> {
        Self::with_output(program, config, Box::new(std::io::stdout()))
    }

    /// Builds a runtime whose trap output goes to `output`.
    pub fn with_output(
        program: Program,
        config: RuntimeConfig,
        output: Box<dyn Write + Send>,
    ) -> Result<Arc<Self>, VmError> {
        let heap = Heap::new(config.heap_limit);
        let class_mem = program
            .classes
            .iter()
            .map(|cls| heap.alloc_static(cls.id, cls.cls_words).map(|h| h as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15)
            | 1;

        debug!(classes = program.classes.len(), "runtime created");
        Ok(Arc::new(Self {
            program,
            heap,
            config,
            class_mem,
            frames: FramePool::default(),
            threads: ThreadRegistry::new(),
            bindings: Mutex::new(HashMap::new()),
            #[cfg(feature = "jit")]
            pages: Mutex::new(PageManager::new()),
            output: Mutex::new(output),
            rng: Mutex::new(seed),
            halted: AtomicBool::new(false),
        }))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    #[cfg(feature = "jit")]
    pub fn pages(&self) -> MutexGuard<'_, PageManager> {
        self.pages.lock()
    }

    /// Static memory of class `cls`, nil for unknown classes.
    pub fn class_memory(&self, cls: usize) -> Handle {
        self.class_mem.get(cls).copied().unwrap_or(0) as Handle
    }

    /// Rebinds a virtual method to the implementation seen from the dynamic
    /// class of `instance`, caching the answer.
    pub fn resolve_virtual(&self, method: &Arc<Method>, instance: Handle) -> Arc<Method> {
        if !method.is_virtual {
            return Arc::clone(method);
        }
        // SAFETY: instance handles on the operand stack come from this heap.
        let Some(dynamic) = (unsafe { Heap::class_of(instance) }) else {
            return Arc::clone(method);
        };
        let key = (dynamic, method.class_id, method.id);
        if let Some(bound) = self.bindings.lock().get(&key) {
            return Arc::clone(bound);
        }
        let bound = self
            .program
            .find_method(dynamic, &method.name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(method));
        self.bindings.lock().insert(key, Arc::clone(&bound));
        bound
    }

    pub fn output(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.output.lock()
    }

    /// Uniform value in `[0, 1)` from a xorshift generator.
    pub fn next_random(&self) -> f64 {
        let mut state = self.rng.lock();
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Reports a fatal fault. Under `OnFault::Halt` every thread stops at its
    /// next call boundary.
    pub fn report_fault(&self, err: &VmError) {
        error!(%err, "runtime fault");
        for frame in err.trace() {
            error!("  method: {}", frame);
        }
        if self.config.on_fault == OnFault::Halt {
            self.halted.store(true, Ordering::Release);
        }
    }
}

/// Per-thread execution state. The layout is part of the native contract:
/// compiled code reads `halt` at offset 0 after every runtime call and
/// checks stack growth against `stack_limit` at offset 16.
#[repr(C)]
pub struct ExecContext {
    pub halt: i64,
    pub call_pos: i64,
    /// Operand stack capacity in words.
    pub stack_limit: i64,
    runtime: Arc<Runtime>,
    pub(crate) frames: Vec<Frame>,
    stack: StackStorage,
    pending: Option<VmError>,
}

impl ExecContext {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let depth = runtime.config().call_stack_size;
        let stack = StackStorage::new(runtime.config().op_stack_size);
        Self {
            halt: 0,
            call_pos: 0,
            stack_limit: stack.capacity() as i64,
            runtime,
            // never grows past `depth`, so frame addresses stay put while
            // compiled code holds pointers into them
            frames: Vec::with_capacity(depth),
            stack,
            pending: None,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn stack(&mut self) -> OperandStack {
        self.stack.view()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.capacity()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn push_frame(
        &mut self,
        method: &Arc<Method>,
        instance: Handle,
    ) -> Result<usize, VmError> {
        let limit = self.frames.capacity();
        if self.frames.len() >= limit {
            return Err(VmError::CallDepthExceeded {
                limit,
                trace: self.trace(),
            });
        }
        let frame = self.runtime.frames().acquire(method, instance);
        self.frames.push(frame);
        self.call_pos = self.frames.len() as i64;
        Ok(self.frames.len() - 1)
    }

    pub(crate) fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.runtime.frames().release(frame);
        }
        self.call_pos = self.frames.len() as i64;
    }

    /// Method names from the innermost frame outwards.
    pub fn trace(&self) -> Trace {
        let program = self.runtime.program();
        self.frames
            .iter()
            .rev()
            .filter_map(|f| f.method.as_ref())
            .map(|m| m.qualified_name(program))
            .collect()
    }

    /// Records a fault raised inside a runtime call made from native code.
    pub(crate) fn set_pending(&mut self, err: VmError) {
        if self.pending.is_none() {
            self.pending = Some(err);
        }
        self.halt = 1;
    }

    pub(crate) fn take_pending(&mut self) -> Option<VmError> {
        self.halt = 0;
        self.pending.take()
    }
}
