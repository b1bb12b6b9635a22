use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use crate::bytecode::codec;
use crate::bytecode::irep::{BLOCK_SYM, Irep, IrepArena, IrepId, SymId, pool_tag};
use crate::bytecode::op::{self, Op};
use crate::runtime::catch::{CatchStack, MAX_UNWIND_DEPTH, UnwindEntry};
use crate::runtime::frame::{CallFrame, CallStack, FrameStackError};
use crate::runtime::registry::{self, VmId};
use crate::runtime::value::{BUILTIN_CLASS_NAMES, ClassId, Exception, Value, class};
use crate::runtime::vm_error::VmError;

// =============================================================================
// VM - the executor
// =============================================================================
//
// One executor exclusively owns one register file, one frame stack, one
// unwind stack and (per session) one code-block arena. `run` is a
// re-entrant step loop: it leaves all state intact when the preemption
// flag suspends it, so a later `run` resumes exactly where it stopped.

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Register-file capacity. Blocks asking for more are rejected at
    /// load time.
    pub max_regs: usize,
    /// Call-frame capacity; exceeding it is fatal resource exhaustion.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_regs: 110,
            max_call_depth: 128,
        }
    }
}

/// How a `run` call ended (fatal errors are the `Err` side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The outermost frame returned or `Stop` executed.
    Complete,
    /// The preemption flag was observed; state is intact for a later
    /// `run`.
    Preempted,
}

/// A host-registered method: the block to execute and the class that
/// owns the definition.
#[derive(Debug, Clone, Copy)]
struct Method {
    irep: IrepId,
    owner: ClassId,
}

enum Flow {
    Continue,
    Done,
}

pub struct Vm {
    id: VmId,
    config: VmConfig,

    /// Code loaded for the current session. Dropped at `end`, which
    /// releases every block exactly once.
    arena: Option<IrepArena>,

    regs: Vec<Value>,
    frames: CallStack,
    unwind: CatchStack,

    // program counter
    cur_irep: IrepId,
    ip: usize,
    /// Absolute base of the current register window.
    base: usize,

    target_class: ClassId,

    /// Exception in flight, present only while propagating.
    exc: Option<Exception>,
    error_code: i32,

    /// Cooperative-preemption request; the host may set it from another
    /// thread via [`Vm::preempt_handle`].
    preempt: Arc<AtomicBool>,

    methods: HashMap<(ClassId, SymId), Method>,
    classes: Vec<String>,
}

impl Vm {
    /// Allocate an executor and register it process-wide.
    pub fn open(config: VmConfig) -> Result<Vm, VmError> {
        let id = registry::acquire()
            .ok_or_else(|| VmError::exhausted("vm ids", registry::MAX_VM_COUNT))?;
        debug!("vm{}: open", id.get());
        Ok(Vm {
            id,
            config,
            arena: None,
            regs: Vec::new(),
            frames: CallStack::new(0),
            unwind: CatchStack::new(),
            cur_irep: IrepId(0),
            ip: 0,
            base: 0,
            target_class: class::OBJECT,
            exc: None,
            error_code: 0,
            preempt: Arc::new(AtomicBool::new(false)),
            methods: HashMap::new(),
            classes: BUILTIN_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Deregister and release the executor. Dropping does the same.
    pub fn close(self) {}

    pub fn vm_id(&self) -> u8 {
        self.id.get()
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    /// Handle the host can set from outside to request suspension at the
    /// next instruction boundary.
    pub fn preempt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.preempt)
    }

    pub fn request_preemption(&self) {
        self.preempt.store(true, Ordering::Release);
    }

    /// The arena attached to the current session, if any.
    pub fn arena(&self) -> Option<&IrepArena> {
        self.arena.as_ref()
    }

    /// Absolute register access, mainly for hosts and tests.
    pub fn register(&self, index: usize) -> &Value {
        &self.regs[index]
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.depth()
    }

    /// Register a class for dispatch and diagnostics.
    pub fn define_class(&mut self, name: &str) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(name.to_string());
        id
    }

    pub fn class_name(&self, id: ClassId) -> &str {
        self.classes
            .get(id.0 as usize)
            .map(|s| s.as_str())
            .unwrap_or("(unknown class)")
    }

    /// Bind `name` on `class` to a loaded block. The name must be a
    /// symbol somewhere in the image, since that is the only way a
    /// `Send` can reference it.
    pub fn define_method(
        &mut self,
        class: ClassId,
        name: &str,
        irep: IrepId,
    ) -> Result<(), VmError> {
        let sym = self
            .attached()?
            .lookup_sym(name)
            .ok_or_else(|| {
                VmError::internal(format!("method name '{}' is not a symbol in the image", name))
            })?;
        self.methods.insert((class, sym), Method { irep, owner: class });
        Ok(())
    }

    /// Human-readable name of the method currently being invoked, for
    /// error reporting.
    pub fn callee_name(&self) -> &str {
        match (self.frames.current(), &self.arena) {
            (Some(frame), Some(arena)) => arena.sym_name(frame.method_id),
            _ => "(top level)",
        }
    }

    /// Start a session: attach `arena` and reset all volatile state.
    pub fn begin(&mut self, arena: IrepArena) -> Result<(), VmError> {
        for i in 0..arena.block_count() {
            let nregs = arena.block(IrepId(i as u32)).nregs as usize;
            if nregs > self.config.max_regs {
                return Err(VmError::exhausted("register file", self.config.max_regs));
            }
        }

        self.cur_irep = arena.root();
        self.arena = Some(arena);
        self.ip = 0;
        self.base = 0;
        self.target_class = class::OBJECT;
        self.regs = vec![Value::Nil; self.config.max_regs];
        self.frames = CallStack::new(self.config.max_call_depth);
        self.unwind.clear();
        self.exc = None;
        self.error_code = 0;
        self.methods.clear();
        self.preempt.store(false, Ordering::Release);
        debug!("vm{}: session begin, root {:?}", self.id.get(), self.cur_irep);
        Ok(())
    }

    /// Guaranteed teardown, regardless of how the session terminated:
    /// releases the arena (and with it every block) and all frames. The
    /// error code survives for post-mortem inspection.
    pub fn end(&mut self) {
        self.arena = None;
        self.frames.clear();
        self.unwind.clear();
        self.exc = None;
        self.regs = Vec::new();
        self.methods.clear();
        debug!("vm{}: session end (error code {})", self.id.get(), self.error_code);
    }

    /// Fetch-decode-execute until completion, a fatal error, or a
    /// preemption request. Fatal errors also record their signed code.
    pub fn run(&mut self) -> Result<RunState, VmError> {
        loop {
            if self.preempt.swap(false, Ordering::AcqRel) {
                debug!(
                    "vm{}: preempted at {:?}:{:04}",
                    self.id.get(),
                    self.cur_irep,
                    self.ip
                );
                return Ok(RunState::Preempted);
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(RunState::Complete),
                Err(e) => {
                    self.error_code = e.code();
                    return Err(e);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // fetch / decode / execute
    // -------------------------------------------------------------------------

    fn step(&mut self) -> Result<Flow, VmError> {
        let (decoded, next_ip) = {
            let irep = self.block(self.cur_irep)?;
            if self.ip >= irep.iseq.len() {
                return Err(VmError::internal("program counter ran past the stream"));
            }
            op::decode(&irep.iseq, self.ip).map_err(|e| VmError::internal(e.to_string()))?
        };
        trace!(
            "vm{}: {:?}:{:04} {:?}",
            self.id.get(),
            self.cur_irep,
            self.ip,
            decoded
        );
        self.ip = next_ip;

        match decoded {
            Op::Nop => {}
            Op::Move { a, b } => {
                let v = self.reg_get(b as usize);
                self.reg_set(a as usize, v);
            }
            Op::LoadPool { a, idx } => {
                let v = self.pool_value(idx)?;
                self.reg_set(a as usize, v);
            }
            Op::LoadInt { a, v } => self.reg_set(a as usize, Value::Integer(v as i64)),
            Op::LoadSym { a, idx } => {
                let sym = self.block(self.cur_irep)?.syms[idx as usize];
                self.reg_set(a as usize, Value::Symbol(sym));
            }
            Op::LoadNil { a } => self.reg_set(a as usize, Value::Nil),
            Op::LoadTrue { a } => self.reg_set(a as usize, Value::Bool(true)),
            Op::LoadFalse { a } => self.reg_set(a as usize, Value::Bool(false)),
            Op::Jump { to } => self.ip = to as usize,
            Op::JumpIf { a, to } => {
                if self.reg_ref(a as usize).truthy() {
                    self.ip = to as usize;
                }
            }
            Op::JumpNot { a, to } => {
                if !self.reg_ref(a as usize).truthy() {
                    self.ip = to as usize;
                }
            }
            Op::Add { a } => self.arith(a, "add")?,
            Op::Sub { a } => self.arith(a, "subtract")?,
            Op::Mul { a } => self.arith(a, "multiply")?,
            Op::Eq { a } => {
                let r = self.reg_ref(a as usize) == self.reg_ref(a as usize + 1);
                self.reg_set(a as usize, Value::Bool(r));
            }
            Op::Lt { a } => self.compare(a, "<")?,
            Op::Gt { a } => self.compare(a, ">")?,
            Op::Send { a, sym, n } => self.op_send(a, sym, n)?,
            Op::Exec { a, child } => self.op_exec(a, child)?,
            Op::Return { a } => return self.op_return(a),
            Op::Stop => return Ok(Flow::Done),
            Op::Raise { a } => {
                let exc = exception_from(self.reg_get(a as usize));
                self.raise(exc)?;
            }
            Op::Except { a } => self.op_except(a)?,
            Op::RaiseIf { a } => {
                if let Value::Exception(e) = self.reg_ref(a as usize) {
                    let e = e.clone();
                    self.raise(e)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn reg_ref(&self, r: usize) -> &Value {
        &self.regs[self.base + r]
    }

    fn reg_get(&self, r: usize) -> Value {
        self.regs[self.base + r].clone()
    }

    fn reg_set(&mut self, r: usize, v: Value) {
        self.regs[self.base + r] = v;
    }

    fn attached(&self) -> Result<&IrepArena, VmError> {
        self.arena
            .as_ref()
            .ok_or_else(|| VmError::internal("no session attached"))
    }

    fn block(&self, id: IrepId) -> Result<&Irep, VmError> {
        Ok(self.attached()?.block(id))
    }

    fn pool_value(&self, idx: u16) -> Result<Value, VmError> {
        let entry = self.attached()?.pool_entry(self.cur_irep, idx as usize);
        match entry[0] {
            pool_tag::INT => Ok(Value::Integer(codec::read_u32(&entry[1..]) as i32 as i64)),
            pool_tag::FLOAT => {
                let hi = codec::read_u32(&entry[1..]) as u64;
                let lo = codec::read_u32(&entry[5..]) as u64;
                Ok(Value::Float(f64::from_bits((hi << 32) | lo)))
            }
            pool_tag::STR => {
                let len = codec::read_u16(&entry[1..]) as usize;
                let s = std::str::from_utf8(&entry[3..3 + len])
                    .map_err(|_| VmError::internal("pool string is not utf-8"))?;
                Ok(Value::String(s.to_string()))
            }
            tag => Err(VmError::internal(format!("unknown pool tag 0x{:02x}", tag))),
        }
    }

    /// `R(a) = R(a) <op> R(a+1)` with numeric coercion; anything else
    /// raises a TypeError into the bytecode's own handlers.
    fn arith(&mut self, a: u8, what: &str) -> Result<(), VmError> {
        let lhs = self.reg_get(a as usize);
        let rhs = self.reg_get(a as usize + 1);
        let result = match (&lhs, &rhs) {
            (Value::Integer(x), Value::Integer(y)) => Value::Integer(match what {
                "add" => x.wrapping_add(*y),
                "subtract" => x.wrapping_sub(*y),
                _ => x.wrapping_mul(*y),
            }),
            (Value::Float(x), Value::Float(y)) => Value::Float(float_op(what, *x, *y)),
            (Value::Integer(x), Value::Float(y)) => Value::Float(float_op(what, *x as f64, *y)),
            (Value::Float(x), Value::Integer(y)) => Value::Float(float_op(what, *x, *y as f64)),
            _ => {
                return self.raise(type_error(format!(
                    "cannot {} {} and {}",
                    what,
                    lhs.type_name(),
                    rhs.type_name()
                )));
            }
        };
        self.reg_set(a as usize, result);
        Ok(())
    }

    fn compare(&mut self, a: u8, what: &str) -> Result<(), VmError> {
        let lhs = self.reg_get(a as usize);
        let rhs = self.reg_get(a as usize + 1);
        let (x, y) = match (numeric(&lhs), numeric(&rhs)) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return self.raise(type_error(format!(
                    "cannot compare {} {} {}",
                    lhs.type_name(),
                    what,
                    rhs.type_name()
                )));
            }
        };
        let r = if what == "<" { x < y } else { x > y };
        self.reg_set(a as usize, Value::Bool(r));
        Ok(())
    }

    fn op_send(&mut self, a: u8, sym_idx: u16, n: u8) -> Result<(), VmError> {
        let sym = self.block(self.cur_irep)?.syms[sym_idx as usize];
        let recv_class = self.reg_ref(a as usize).class_of();

        // receiver-class lookup with Object fallback
        let method = self
            .methods
            .get(&(recv_class, sym))
            .or_else(|| self.methods.get(&(class::OBJECT, sym)))
            .copied();

        let Some(method) = method else {
            let name = self.attached()?.sym_name(sym).to_string();
            return self.raise(Exception {
                class: class::RUNTIME_ERROR,
                message: Box::new(Value::String(format!("undefined method '{}'", name))),
            });
        };

        self.push_call(a, sym, n, method.irep, method.owner, recv_class)
    }

    fn op_exec(&mut self, a: u8, child: u16) -> Result<(), VmError> {
        let child_id = self.block(self.cur_irep)?.children[child as usize];
        // anonymous blocks run in the caller's class context
        let target = self.target_class;
        self.push_call(a, BLOCK_SYM, 0, child_id, target, target)
    }

    /// Snapshot the current resume state into a new frame, then advance
    /// into the callee. The callee's window starts at the receiver's
    /// register, so its `R(0)` aliases the caller's call-site register.
    fn push_call(
        &mut self,
        a: u8,
        method_id: SymId,
        n_args: u8,
        callee: IrepId,
        own_class: ClassId,
        new_target: ClassId,
    ) -> Result<(), VmError> {
        let new_base = self.base + a as usize;
        let callee_nregs = self.block(callee)?.nregs as usize;
        if new_base + callee_nregs > self.config.max_regs {
            return Err(VmError::exhausted("register file", self.config.max_regs));
        }

        let frame = CallFrame {
            ret_irep: self.cur_irep,
            ret_ip: self.ip,
            ret_base: self.base,
            ret_target_class: self.target_class,
            own_class,
            method_id,
            reg_offset: new_base,
            n_args,
        };
        self.frames.push(frame).map_err(|e| match e {
            FrameStackError::Overflow { capacity } => VmError::exhausted("call frames", capacity),
            FrameStackError::Underflow => VmError::FrameUnderflow,
        })?;

        debug!(
            "vm{}: call {:?} -> {:?} (depth {})",
            self.id.get(),
            method_id,
            callee,
            self.frames.depth()
        );
        self.cur_irep = callee;
        self.ip = 0;
        self.base = new_base;
        self.target_class = new_target;
        Ok(())
    }

    /// Place the return value in the callee's `R(0)` (the caller's
    /// call-site register) and restore the caller snapshot. On the
    /// outermost frame this completes the session.
    fn op_return(&mut self, a: u8) -> Result<Flow, VmError> {
        let value = self.reg_get(a as usize);
        self.regs[self.base] = value;

        if self.frames.is_empty() {
            debug!("vm{}: outermost return", self.id.get());
            return Ok(Flow::Done);
        }

        let frame = self.frames.pop().map_err(|_| VmError::FrameUnderflow)?;
        self.cur_irep = frame.ret_irep;
        self.ip = frame.ret_ip;
        self.base = frame.ret_base;
        self.target_class = frame.ret_target_class;
        debug!("vm{}: return (depth {})", self.id.get(), self.frames.depth());
        Ok(Flow::Continue)
    }

    /// Handler prologue: consume the unwind entry for the activation (if
    /// the handler was entered by propagation) and hand the pending
    /// exception to the bytecode.
    fn op_except(&mut self, a: u8) -> Result<(), VmError> {
        let delivered = match self.exc.take() {
            Some(e) => {
                if self.unwind.pop().is_none() {
                    return Err(VmError::internal(
                        "pending exception without an unwind entry",
                    ));
                }
                Value::Exception(e)
            }
            // normal path fell into an ensure body
            None => Value::Nil,
        };
        self.reg_set(a as usize, delivered);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // exception propagation
    // -------------------------------------------------------------------------

    fn raise(&mut self, exc: Exception) -> Result<(), VmError> {
        debug!(
            "vm{}: raise {} ({}) at {:?}:{:04}",
            self.id.get(),
            exc.message,
            self.class_name(exc.class),
            self.cur_irep,
            self.ip
        );
        self.exc = Some(exc);
        self.propagate()
    }

    /// Search for a handler covering the current address, in declaration
    /// order, popping call frames until one is found. The search address
    /// is the address of the instruction after the raise point; across
    /// frames it is the caller's resume address.
    fn propagate(&mut self) -> Result<(), VmError> {
        loop {
            let found = {
                let irep = self.block(self.cur_irep)?;
                let addr = self.ip as u32;
                irep.handlers.iter().find(|h| h.covers(addr)).copied()
            };

            if let Some(h) = found {
                self.unwind
                    .push(UnwindEntry {
                        kind: h.kind,
                        target: h.target,
                    })
                    .map_err(|_| VmError::exhausted("unwind stack", MAX_UNWIND_DEPTH))?;
                debug!(
                    "vm{}: {} handler [{}, {}) -> {:04}",
                    self.id.get(),
                    h.kind,
                    h.begin,
                    h.end,
                    h.target
                );
                self.ip = h.target as usize;
                return Ok(());
            }

            match self.frames.pop() {
                Ok(frame) => {
                    self.cur_irep = frame.ret_irep;
                    self.ip = frame.ret_ip;
                    self.base = frame.ret_base;
                    self.target_class = frame.ret_target_class;
                    debug!(
                        "vm{}: exception propagates to caller (depth {})",
                        self.id.get(),
                        self.frames.depth()
                    );
                }
                Err(_) => {
                    let exc = match self.exc.take() {
                        Some(e) => e,
                        None => Exception {
                            class: class::RUNTIME_ERROR,
                            message: Box::new(Value::Nil),
                        },
                    };
                    return Err(VmError::UnhandledException {
                        class_name: self.class_name(exc.class).to_string(),
                        message: exc.message.to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        registry::release(self.id);
    }
}

fn float_op(what: &str, x: f64, y: f64) -> f64 {
    match what {
        "add" => x + y,
        "subtract" => x - y,
        _ => x * y,
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

fn exception_from(v: Value) -> Exception {
    match v {
        Value::Exception(e) => e,
        other => Exception {
            class: class::RUNTIME_ERROR,
            message: Box::new(other),
        },
    }
}

fn type_error(message: String) -> Exception {
    Exception {
        class: class::TYPE_ERROR,
        message: Box::new(Value::String(message)),
    }
}
