//! Reference host.
//!
//! Loads code units through a [`UnitTransformer`], verifies the declared
//! stack metadata of every method against a fresh dataflow pass, and
//! interprets the result. Probe calls to the counter unit are dispatched
//! natively into the shared [`CounterStore`].

use crate::error::{Error, Result};
use crate::hook::UnitTransformer;
use crate::unit::{self, CodeUnit, Const, Method, Op, compute_frames};
use hotpath_counter::{CounterStore, PROBE_METHOD, PROBE_OWNER};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Nested calls deeper than this abort execution.
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(Arc<str>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&Const> for Value {
    fn from(c: &Const) -> Self {
        match c {
            Const::Int(v) => Value::Int(*v),
            Const::Str(s) => Value::Str(Arc::from(s.as_str())),
        }
    }
}

/// `com.app.Main.run` -> unit `com/app/Main`, method `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub unit: String,
    pub method: String,
}

impl EntryPoint {
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.rsplit_once('.') {
            Some((unit, method)) if !unit.is_empty() && !method.is_empty() => Ok(EntryPoint {
                unit: unit::internal(unit),
                method: method.to_string(),
            }),
            _ => Err(Error::InvalidArgument(format!(
                "entry point '{entry}' must look like <unit>.<method>"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub name: String,
    pub instrumented: bool,
}

/// Check declared `max_stack` and frames against what the code requires.
pub fn verify(unit: &CodeUnit) -> Result<()> {
    for method in &unit.methods {
        let fail = |reason: String| Error::Verification {
            unit: unit.name.clone(),
            method: method.name.clone(),
            reason,
        };
        let summary = compute_frames(method).map_err(|e| fail(e.to_string()))?;
        if method.max_stack < summary.max_stack {
            return Err(fail(format!(
                "declared max_stack {} but code needs {}",
                method.max_stack, summary.max_stack
            )));
        }
        if method.frames != summary.frames {
            return Err(fail(format!(
                "frame table {:?} does not match computed {:?}",
                method.frames, summary.frames
            )));
        }
    }
    Ok(())
}

pub struct Host {
    store: Arc<CounterStore>,
    transformer: Option<Arc<dyn UnitTransformer>>,
    units: RwLock<HashMap<String, Arc<CodeUnit>>>,
}

impl Host {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Host {
            store,
            transformer: None,
            units: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn UnitTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Offer the bytes to the transformer, then decode, verify and register
    /// whatever comes back.
    pub fn load(&self, bytes: &[u8]) -> Result<LoadOutcome> {
        let name = unit::peek_name(bytes)?;
        let rewritten = self
            .transformer
            .as_ref()
            .and_then(|t| t.transform(Some(name.as_str()), bytes));
        let instrumented = rewritten.is_some();

        let unit = unit::decode(rewritten.as_deref().unwrap_or(bytes))?;
        verify(&unit)?;

        debug!(unit = %unit.name, instrumented, "Loaded");
        let name = unit.name.clone();
        self.units.write().insert(name.clone(), Arc::new(unit));
        Ok(LoadOutcome { name, instrumented })
    }

    /// Load units concurrently, one loader thread per unit.
    pub fn load_all<B: AsRef<[u8]> + Sync>(&self, units: &[B]) -> Result<Vec<LoadOutcome>> {
        let outcomes: Vec<Result<LoadOutcome>> = thread::scope(|scope| {
            let handles: Vec<_> = units
                .iter()
                .map(|bytes| scope.spawn(move || self.load(bytes.as_ref())))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::InvalidArgument("loader thread panicked".into()))
                    })
                })
                .collect()
        });
        let outcomes = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        info!(
            units = outcomes.len(),
            instrumented = outcomes.iter().filter(|o| o.instrumented).count(),
            "Units loaded"
        );
        Ok(outcomes)
    }

    pub fn unit(&self, name: &str) -> Option<Arc<CodeUnit>> {
        self.units.read().get(name).cloned()
    }

    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.units.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `unit.method` with `args`. An exception escaping the method is an
    /// [`Error::Uncaught`].
    pub fn invoke(&self, unit: &str, method: &str, args: &[Value]) -> Result<Option<Value>> {
        let code = self
            .unit(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.to_string()))?;
        let target = method_index(&code, method)?;
        let params = code.methods[target].params;
        if usize::from(params) != args.len() {
            return Err(Error::InvalidArgument(format!(
                "{unit}.{method} takes {params} arguments, got {}",
                args.len()
            )));
        }
        match self.execute(code, target, args.to_vec())? {
            Flow::Return(value) => Ok(value),
            Flow::Throw(value) => Err(Error::Uncaught {
                unit: unit.to_string(),
                method: method.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn run_entry(&self, entry: &EntryPoint) -> Result<Option<Value>> {
        self.invoke(&entry.unit, &entry.method, &[])
    }

    /// Interpret until the outermost frame returns or a throw escapes it.
    /// Guest calls live on `callers`, never on the native stack.
    fn execute(&self, unit: Arc<CodeUnit>, method: usize, args: Vec<Value>) -> Result<Flow> {
        let mut frame = ExecFrame::new(unit, method, args, false);
        let mut callers: Vec<ExecFrame> = Vec::new();

        loop {
            let unit = Arc::clone(&frame.unit);
            let code = &unit.methods[frame.method];
            let insn = code
                .code
                .get(frame.idx)
                .ok_or_else(|| frame.fault("pc out of range"))?;
            frame.pc = insn.pc;
            let mut next = frame.idx + 1;

            match &insn.op {
                Op::Nop => {}
                Op::Push(c) => frame.push(Value::from(c)),
                Op::Load(slot) => {
                    let value = frame.local(*slot)?.clone();
                    frame.push(value);
                }
                Op::Store(slot) => {
                    let value = frame.pop()?;
                    *frame.local(*slot)? = value;
                }
                Op::Add => frame.arith(i64::wrapping_add)?,
                Op::Sub => frame.arith(i64::wrapping_sub)?,
                Op::Mul => frame.arith(i64::wrapping_mul)?,
                Op::Lt => frame.arith(|a, b| i64::from(a < b))?,
                Op::Dup => {
                    let top = frame.pop()?;
                    frame.push(top.clone());
                    frame.push(top);
                }
                Op::Pop => {
                    frame.pop()?;
                }
                Op::Goto(target) => next = frame.index(*target)?,
                Op::IfZero(target) => {
                    if frame.pop_int()? == 0 {
                        next = frame.index(*target)?;
                    }
                }
                Op::IfNonZero(target) => {
                    if frame.pop_int()? != 0 {
                        next = frame.index(*target)?;
                    }
                }
                Op::Invoke {
                    owner,
                    name,
                    argc,
                    returns,
                } => {
                    let split = frame
                        .stack
                        .len()
                        .checked_sub(usize::from(*argc))
                        .ok_or_else(|| frame.fault("stack underflow"))?;
                    let call_args = frame.stack.split_off(split);

                    if owner == PROBE_OWNER && name == PROBE_METHOD {
                        if *returns {
                            return Err(frame.fault("probe call site expects a result"));
                        }
                        self.record_probe(&frame, &call_args)?;
                    } else {
                        if callers.len() + 1 >= MAX_CALL_DEPTH {
                            return Err(frame.fault("call depth exceeded"));
                        }
                        let callee_unit = self
                            .unit(owner)
                            .ok_or_else(|| Error::UnitNotFound(owner.to_string()))?;
                        let callee = method_index(&callee_unit, name)?;
                        let params = callee_unit.methods[callee].params;
                        if usize::from(params) != call_args.len() {
                            return Err(frame.fault(&format!(
                                "{owner}.{name} takes {params} arguments, got {}",
                                call_args.len()
                            )));
                        }
                        frame.idx = next;
                        let callee = ExecFrame::new(callee_unit, callee, call_args, *returns);
                        callers.push(std::mem::replace(&mut frame, callee));
                        continue;
                    }
                }
                Op::Throw => {
                    let value = frame.pop()?;
                    match unwind(&mut frame, &mut callers, value)? {
                        Some(escaped) => return Ok(Flow::Throw(escaped)),
                        None => continue,
                    }
                }
                op @ (Op::Return | Op::ReturnVoid) => {
                    let value = match op {
                        Op::Return => Some(frame.pop()?),
                        _ => None,
                    };
                    let Some(caller) = callers.pop() else {
                        return Ok(Flow::Return(value));
                    };
                    if value.is_some() != frame.returns {
                        return Err(caller.fault(&format!(
                            "{}.{} returned a value shape the call site does not expect",
                            frame.unit.name,
                            frame.method().name
                        )));
                    }
                    frame = caller;
                    if let Some(value) = value {
                        frame.push(value);
                    }
                    continue;
                }
            }

            frame.idx = next;
        }
    }

    fn record_probe(&self, caller: &ExecFrame, args: &[Value]) -> Result<()> {
        match args {
            [Value::Str(unit), Value::Int(line)] => {
                let line =
                    u32::try_from(*line).map_err(|_| caller.fault("probe line out of range"))?;
                self.store.record(unit, line);
                Ok(())
            }
            _ => Err(caller.fault("malformed probe arguments")),
        }
    }
}

/// Route `value` to the first handler covering the pc of `frame`, popping
/// callers until one catches it. Returns the value when nothing does.
fn unwind(
    frame: &mut ExecFrame,
    callers: &mut Vec<ExecFrame>,
    value: Value,
) -> Result<Option<Value>> {
    loop {
        if let Some(target) = frame.handler() {
            frame.idx = frame.index(target)?;
            frame.stack.clear();
            frame.stack.push(value);
            return Ok(None);
        }
        match callers.pop() {
            Some(caller) => *frame = caller,
            None => return Ok(Some(value)),
        }
    }
}

fn method_index(unit: &CodeUnit, name: &str) -> Result<usize> {
    unit.methods
        .iter()
        .position(|m| m.name == name)
        .ok_or_else(|| Error::MethodNotFound {
            unit: unit.name.clone(),
            method: name.to_string(),
        })
}

enum Flow {
    Return(Option<Value>),
    Throw(Value),
}

struct ExecFrame {
    unit: Arc<CodeUnit>,
    /// Index into `unit.methods`.
    method: usize,
    idx: usize,
    pc: u32,
    stack: Vec<Value>,
    locals: Vec<Value>,
    /// Whether the call site that created this frame expects a result.
    returns: bool,
}

impl ExecFrame {
    fn new(unit: Arc<CodeUnit>, method: usize, args: Vec<Value>, returns: bool) -> Self {
        let (max_locals, max_stack) = {
            let m = &unit.methods[method];
            (m.max_locals, m.max_stack)
        };
        let mut locals = args;
        locals.resize(usize::from(max_locals), Value::Int(0));
        ExecFrame {
            unit,
            method,
            idx: 0,
            pc: 0,
            stack: Vec::with_capacity(usize::from(max_stack)),
            locals,
            returns,
        }
    }

    fn method(&self) -> &Method {
        &self.unit.methods[self.method]
    }

    fn fault(&self, reason: &str) -> Error {
        Error::Execution {
            unit: self.unit.name.clone(),
            method: self.method().name.clone(),
            pc: self.pc,
            reason: reason.to_string(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| self.fault("stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64> {
        let value = self.pop()?;
        value
            .as_int()
            .ok_or_else(|| self.fault(&format!("expected an integer, found {value}")))
    }

    fn arith(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<()> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(f(a, b)));
        Ok(())
    }

    fn local(&mut self, slot: u16) -> Result<&mut Value> {
        let slot = usize::from(slot);
        if slot >= self.locals.len() {
            return Err(self.fault(&format!("local slot {slot} out of range")));
        }
        Ok(&mut self.locals[slot])
    }

    fn index(&self, pc: u32) -> Result<usize> {
        self.method()
            .index_of(pc)
            .ok_or_else(|| self.fault(&format!("branch to {pc} is not an instruction")))
    }

    /// Target pc of the first handler covering the current pc.
    fn handler(&self) -> Option<u32> {
        self.method()
            .handlers
            .iter()
            .find(|h| h.start <= self.pc && self.pc < h.end)
            .map(|h| h.target)
    }
}
