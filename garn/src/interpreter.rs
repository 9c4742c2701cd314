use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    sync::Arc,
};

use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    replicate::replicate, ClassDef, Constant, ContainerError, Function, FunctionDef, IniEntry,
    InternalFn, MarshalError, ObjectData, Op, Plain, ProgramState, Thread, ThreadRegistry, Value,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("call to undefined function {0}()")]
    UnknownFunction(String),
    #[error("class {0} not found")]
    UnknownClass(String),
    #[error("call to undefined method {class}::{method}()")]
    UnknownMethod { class: String, method: String },
    #[error("undefined constant {0}")]
    UnknownConstant(String),
    #[error("no compiled unit for path {0}")]
    UnknownUnit(String),
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("expected {expected}, found {found}")]
    TypeError {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}")]
    Failure(String),
    #[error("integer overflow in arithmetic")]
    ArithmeticOverflow,
    #[error("evaluation stack underflow")]
    StackUnderflow,
    #[error("literal index {0} out of range")]
    BadLiteral(u16),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// One interpreter instance. Owns its mutable runtime state (globals,
/// static variables) and shares the execution context behind a
/// read/write lock: threads spawned from this interpreter replicate
/// the context under a read lock, while definition calls take the
/// write lock.
pub struct Interpreter {
    program: Arc<RwLock<ProgramState>>,
    pub globals: HashMap<String, Value>,
    /// Runtime values of function-level statics, keyed by
    /// `filename::function`.
    statics: HashMap<String, HashMap<String, Value>>,
    threads: ThreadRegistry,
    /// Messages of failed tasks run on this instance. Task failures
    /// never cross threads; they land here and in the log.
    task_errors: Vec<String>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            program: Arc::new(RwLock::new(bootstrap_program())),
            globals: HashMap::new(),
            statics: HashMap::new(),
            threads: ThreadRegistry::default(),
            task_errors: Vec::new(),
        }
    }

    /// Builds the interpreter a worker thread runs: a fresh bootstrap
    /// plus a replica of the parent's execution context, taken under
    /// the parent's read lock.
    pub fn child_of(parent: &Arc<RwLock<ProgramState>>) -> Self {
        let interp = Self::new();
        {
            let parent_state = parent.read();
            let mut child_state = interp.program.write();
            replicate(&parent_state, &mut child_state);
        }
        interp
    }

    pub fn program(&self) -> &Arc<RwLock<ProgramState>> {
        &self.program
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Creates a thread bound to this interpreter's execution context.
    /// The thread is tracked until it is joined; any still tracked when
    /// this interpreter shuts down is force-joined.
    pub fn spawn_thread(&self) -> Thread {
        Thread::create(self.program.clone(), self.threads.clone())
    }

    /// Joins every thread this interpreter still tracks.
    pub fn shutdown(&mut self) {
        self.threads.join_all();
    }

    pub fn define_function(&self, func: Function) {
        let key = func.name.to_ascii_lowercase();
        self.program
            .write()
            .functions
            .insert(key, FunctionDef::User(func));
    }

    pub fn define_builtin(&self, name: &str, handler: crate::BuiltinFn) {
        self.program.write().functions.insert(
            name.to_ascii_lowercase(),
            FunctionDef::Internal(InternalFn {
                name: name.to_owned(),
                handler,
            }),
        );
    }

    pub fn define_class(&self, mut class: ClassDef) {
        for method in &mut class.methods {
            method.owner = Some(class.name.clone());
        }
        let key = class.name.to_ascii_lowercase();
        self.program.write().classes.insert(key, class);
    }

    pub fn define_constant(&self, name: &str, value: Plain) {
        self.program.write().constants.insert(
            name.to_owned(),
            Constant {
                name: name.to_owned(),
                value,
            },
        );
    }

    /// Registers the compiled top-level body of a source file.
    pub fn define_unit(&self, path: &str, body: Function) {
        self.program.write().units.insert(path.to_owned(), body);
    }

    pub fn mark_included(&self, path: &str) {
        self.program.write().included_files.insert(path.to_owned());
    }

    /// Records a task failure on this instance and in the log.
    pub fn report_task_error(&mut self, err: &RuntimeError) {
        log::error!("task failed: {err}");
        self.task_errors.push(err.to_string());
    }

    pub fn task_errors(&self) -> &[String] {
        &self.task_errors
    }

    /// Overrides a configuration entry, keeping the original value for
    /// replay bookkeeping. Unknown entries are ignored.
    pub fn set_ini(&self, name: &str, value: &str) {
        let mut program = self.program.write();
        let Some(entry) = program.ini.get_mut(name) else {
            return;
        };
        if entry.value == value {
            return;
        }
        if !entry.modified {
            entry.orig_value = Some(entry.value.clone());
            entry.modified = true;
        }
        entry.value = value.to_owned();
    }

    pub fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let def = self.program.read().lookup_function(name).cloned();
        match def {
            None => Err(RuntimeError::UnknownFunction(name.to_owned())),
            Some(FunctionDef::Internal(f)) => (f.handler)(self, args),
            Some(FunctionDef::User(f)) => self.invoke(&f, None, args),
        }
    }

    pub fn call_method(
        &mut self,
        object: &Rc<RefCell<ObjectData>>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let class = object.borrow().class.clone();
        let found = self
            .program
            .read()
            .find_method(&class, method)
            .map(|(_, m)| m.clone());
        match found {
            Some(f) => self.invoke(&f, Some(object.clone()), args),
            None => Err(RuntimeError::UnknownMethod {
                class,
                method: method.to_owned(),
            }),
        }
    }

    /// Dispatches any callable value: a function name, a closure, or a
    /// two-element `[object, method]` array.
    pub fn call_value(&mut self, callable: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        match callable {
            Value::Str(name) => {
                let name = name.to_string();
                self.call_function(&name, args)
            }
            Value::Closure(f) => {
                let f = f.as_ref().clone();
                self.invoke(&f, None, args)
            }
            Value::Array(items) => match items.as_slice() {
                [(_, Value::Object(obj)), (_, Value::Str(method))] => {
                    let obj = obj.clone();
                    let method = method.to_string();
                    self.call_method(&obj, &method, args)
                }
                _ => Err(RuntimeError::NotCallable("array")),
            },
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    /// Creates an instance of `class`, running its constructor when one
    /// exists anywhere on the inheritance chain.
    pub fn instantiate(&mut self, class: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let (name, defaults, constructor) = {
            let program = self.program.read();
            let def = program
                .lookup_class(class)
                .ok_or_else(|| RuntimeError::UnknownClass(class.to_owned()))?;
            let constructor = program
                .find_method(class, "__construct")
                .map(|(_, m)| m.clone());
            (def.name.clone(), program.default_properties(class), constructor)
        };
        let properties = defaults
            .into_iter()
            .map(|(prop, value)| (prop, value.to_value()))
            .collect();
        let object = Rc::new(RefCell::new(ObjectData {
            class: name,
            properties,
        }));
        if let Some(ctor) = constructor {
            self.invoke(&ctor, Some(object.clone()), args)?;
        }
        Ok(Value::Object(object))
    }

    /// Invokes the designated entry method of a threaded object.
    pub fn run_object(&mut self, object: &Rc<RefCell<ObjectData>>) -> Result<Value, RuntimeError> {
        self.call_method(object, "run", &[])
    }

    /// Executes the compiled body of a source file, exposing `args`
    /// through the `_THREAD` global and marking the file as included.
    pub fn execute_file(&mut self, path: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let unit = self
            .program
            .read()
            .units
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownUnit(path.to_owned()))?;
        self.globals.insert("_THREAD".into(), Value::array_of(args));
        self.program.write().included_files.insert(path.to_owned());
        self.invoke(&unit, None, &[])
    }

    /// The evaluator: a straightforward stack machine over [`Op`].
    pub fn invoke(
        &mut self,
        func: &Function,
        this: Option<Rc<RefCell<ObjectData>>>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let mut bound: Vec<Value> = args.to_vec();
        for (pos, param) in func.params.iter().enumerate() {
            if pos >= bound.len() {
                bound.push(match &param.default {
                    Some(default) => default.to_value(),
                    None => Value::Null,
                });
            }
        }

        // Methods carry their defining class so same-named methods of
        // different classes in one file never share a static table.
        let statics_key = match &func.owner {
            Some(owner) => format!("{}::{}::{}", func.filename, owner, func.name),
            None => format!("{}::{}", func.filename, func.name),
        };
        if !func.statics.is_empty() && !self.statics.contains_key(&statics_key) {
            let seeded = func
                .statics
                .iter()
                .map(|(name, value)| (name.clone(), value.to_value()))
                .collect();
            self.statics.insert(statics_key.clone(), seeded);
        }

        let mut stack: Vec<Value> = Vec::new();
        let mut locals: Vec<Value> = Vec::new();
        let mut pc = 0usize;

        while pc < func.code.len() {
            let op = func.code[pc];
            pc += 1;
            match op {
                Op::PushLiteral(idx) => {
                    let literal = func
                        .literals
                        .get(idx as usize)
                        .ok_or(RuntimeError::BadLiteral(idx))?;
                    stack.push(literal.to_value());
                }
                Op::PushArg(n) => {
                    stack.push(bound.get(n as usize).cloned().unwrap_or(Value::Null));
                }
                Op::PushLocal(n) => {
                    stack.push(locals.get(n as usize).cloned().unwrap_or(Value::Null));
                }
                Op::StoreLocal(n) => {
                    let value = pop(&mut stack)?;
                    let slot = n as usize;
                    if locals.len() <= slot {
                        locals.resize(slot + 1, Value::Null);
                    }
                    locals[slot] = value;
                }
                Op::PushThis => match &this {
                    Some(obj) => stack.push(Value::Object(obj.clone())),
                    None => stack.push(Value::Null),
                },
                Op::PushGlobal(idx) => {
                    let name = literal_str(func, idx)?;
                    stack.push(self.globals.get(name).cloned().unwrap_or(Value::Null));
                }
                Op::StoreGlobal(idx) => {
                    let name = literal_str(func, idx)?.to_owned();
                    let value = pop(&mut stack)?;
                    self.globals.insert(name, value);
                }
                Op::PushStatic(idx) => {
                    let name = literal_str(func, idx)?;
                    let value = self
                        .statics
                        .get(&statics_key)
                        .and_then(|table| table.get(name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    stack.push(value);
                }
                Op::StoreStatic(idx) => {
                    let name = literal_str(func, idx)?.to_owned();
                    let value = pop(&mut stack)?;
                    self.statics
                        .entry(statics_key.clone())
                        .or_default()
                        .insert(name, value);
                }
                Op::PushConst(idx) => {
                    let name = literal_str(func, idx)?;
                    let constant = self
                        .program
                        .read()
                        .constants
                        .get(name)
                        .map(|c| c.value.to_value());
                    match constant {
                        Some(value) => stack.push(value),
                        None => return Err(RuntimeError::UnknownConstant(name.to_owned())),
                    }
                }
                Op::GetProp(idx) => {
                    let name = literal_str(func, idx)?;
                    let object = pop_object(&mut stack)?;
                    let value = object
                        .borrow()
                        .properties
                        .get(name)
                        .cloned()
                        .unwrap_or(Value::Null);
                    stack.push(value);
                }
                Op::SetProp(idx) => {
                    let name = literal_str(func, idx)?.to_owned();
                    let value = pop(&mut stack)?;
                    let object = pop_object(&mut stack)?;
                    object.borrow_mut().properties.insert(name, value);
                }
                Op::Add => binop(&mut stack, i64::checked_add, |a, b| a + b)?,
                Op::Sub => binop(&mut stack, i64::checked_sub, |a, b| a - b)?,
                Op::Mul => binop(&mut stack, i64::checked_mul, |a, b| a * b)?,
                Op::Lt => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    let result = match (&lhs, &rhs) {
                        (Value::Int(a), Value::Int(b)) => a < b,
                        (Value::Float(a), Value::Float(b)) => a < b,
                        (Value::Int(a), Value::Float(b)) => (*a as f64) < *b,
                        (Value::Float(a), Value::Int(b)) => *a < *b as f64,
                        _ => {
                            return Err(RuntimeError::TypeError {
                                expected: "number",
                                found: lhs.type_name(),
                            })
                        }
                    };
                    stack.push(Value::Bool(result));
                }
                Op::Eq => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(Value::Bool(lhs == rhs));
                }
                Op::Jump(target) => {
                    pc = target as usize;
                }
                Op::JumpIfFalse(target) => {
                    let cond = pop(&mut stack)?;
                    if !cond.truthy() {
                        pc = target as usize;
                    }
                }
                Op::Call { name, argc } => {
                    let name = literal_str(func, name)?.to_owned();
                    let call_args = pop_args(&mut stack, argc)?;
                    let result = self.call_function(&name, &call_args)?;
                    stack.push(result);
                }
                Op::CallMethod { name, argc } => {
                    let name = literal_str(func, name)?.to_owned();
                    let call_args = pop_args(&mut stack, argc)?;
                    let object = pop_object(&mut stack)?;
                    let result = self.call_method(&object, &name, &call_args)?;
                    stack.push(result);
                }
                Op::New { class, argc } => {
                    let class = literal_str(func, class)?.to_owned();
                    let call_args = pop_args(&mut stack, argc)?;
                    let result = self.instantiate(&class, &call_args)?;
                    stack.push(result);
                }
                Op::Pop => {
                    pop(&mut stack)?;
                }
                Op::Return => return Ok(stack.pop().unwrap_or(Value::Null)),
            }
        }
        Ok(Value::Null)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, RuntimeError> {
    stack.pop().ok_or(RuntimeError::StackUnderflow)
}

fn pop_object(stack: &mut Vec<Value>) -> Result<Rc<RefCell<ObjectData>>, RuntimeError> {
    match pop(stack)? {
        Value::Object(obj) => Ok(obj),
        other => Err(RuntimeError::TypeError {
            expected: "object",
            found: other.type_name(),
        }),
    }
}

fn pop_args(stack: &mut Vec<Value>, argc: u8) -> Result<Vec<Value>, RuntimeError> {
    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        args.push(pop(stack)?);
    }
    args.reverse();
    Ok(args)
}

fn literal_str(func: &Function, idx: u16) -> Result<&str, RuntimeError> {
    match func.literals.get(idx as usize) {
        Some(Plain::Str(s)) => Ok(s),
        _ => Err(RuntimeError::BadLiteral(idx)),
    }
}

// Integer overflow surfaces as an error the task boundary absorbs,
// never a panic that would take the worker down.
fn binop(
    stack: &mut Vec<Value>,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<(), RuntimeError> {
    let rhs = pop(stack)?;
    let lhs = pop(stack)?;
    let result = match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            Value::Int(int_op(*a, *b).ok_or(RuntimeError::ArithmeticOverflow)?)
        }
        (Value::Float(a), Value::Float(b)) => Value::Float(float_op(*a, *b)),
        (Value::Int(a), Value::Float(b)) => Value::Float(float_op(*a as f64, *b)),
        (Value::Float(a), Value::Int(b)) => Value::Float(float_op(*a, *b as f64)),
        _ => {
            return Err(RuntimeError::TypeError {
                expected: "number",
                found: lhs.type_name(),
            })
        }
    };
    stack.push(result);
    Ok(())
}

/// The context every interpreter starts from: native functions, the
/// base object class, and default configuration. Replication never
/// copies any of this; a child resolves it from its own bootstrap.
fn bootstrap_program() -> ProgramState {
    let mut program = ProgramState::default();
    for (name, handler) in BUILTINS {
        program.functions.insert(
            name.to_ascii_lowercase(),
            FunctionDef::Internal(InternalFn {
                name: (*name).to_owned(),
                handler: *handler,
            }),
        );
    }
    program
        .classes
        .insert("stdclass".into(), ClassDef::internal("stdClass"));
    for (name, value) in [
        ("precision", "14"),
        ("memory_limit", "128M"),
        ("include_path", "."),
    ] {
        program.ini.insert(name.to_owned(), IniEntry::new(value));
    }
    program
}

const BUILTINS: &[(&str, crate::BuiltinFn)] = &[
    ("queue_create", builtin_queue_create),
    ("hashtable_create", builtin_hashtable_create),
    ("vector_create", builtin_vector_create),
    ("atomic_create", builtin_atomic_create),
    ("strlen", builtin_strlen),
    ("count", builtin_count),
    ("println", builtin_println),
    ("fail", builtin_fail),
    ("thread_arg", builtin_thread_arg),
    ("queue_push", builtin_queue_push),
    ("queue_pop", builtin_queue_pop),
    ("queue_size", builtin_queue_size),
    ("hashtable_write", builtin_hashtable_write),
    ("hashtable_read", builtin_hashtable_read),
    ("vector_push", builtin_vector_push),
    ("atomic_inc", builtin_atomic_inc),
    ("atomic_get", builtin_atomic_get),
];

fn arg<'a>(args: &'a [Value], n: usize) -> Result<&'a Value, RuntimeError> {
    args.get(n).ok_or(RuntimeError::TypeError {
        expected: "argument",
        found: "nothing",
    })
}

fn builtin_queue_create(_: &mut Interpreter, _: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Queue(crate::Queue::new()))
}

fn builtin_hashtable_create(_: &mut Interpreter, _: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::HashTable(crate::HashTable::new()))
}

fn builtin_vector_create(_: &mut Interpreter, _: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Vector(crate::Vector::new()))
}

fn builtin_atomic_create(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    let initial = match args.first() {
        Some(Value::Int(n)) => *n,
        _ => 0,
    };
    Ok(Value::AtomicInteger(crate::AtomicInteger::new(initial)))
}

fn builtin_strlen(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Str(s) => Ok(Value::Int(s.len() as i64)),
        other => Err(RuntimeError::TypeError {
            expected: "string",
            found: other.type_name(),
        }),
    }
}

fn builtin_count(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Array(items) => Ok(Value::Int(items.len() as i64)),
        Value::Queue(q) => Ok(Value::Int(q.size() as i64)),
        Value::Vector(v) => Ok(Value::Int(v.size() as i64)),
        Value::HashTable(t) => Ok(Value::Int(t.count() as i64)),
        other => Err(RuntimeError::TypeError {
            expected: "countable",
            found: other.type_name(),
        }),
    }
}

fn builtin_println(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Str(s) => log::info!("{s}"),
        other => log::info!("{other:?}"),
    }
    Ok(Value::Null)
}

fn builtin_fail(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    let message = match arg(args, 0) {
        Ok(Value::Str(s)) => s.to_string(),
        _ => "failure".to_owned(),
    };
    Err(RuntimeError::Failure(message))
}

/// Reads one positional argument of a file task out of the `_THREAD`
/// global.
fn builtin_thread_arg(interp: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    let index = match arg(args, 0)? {
        Value::Int(n) => *n,
        other => {
            return Err(RuntimeError::TypeError {
                expected: "int",
                found: other.type_name(),
            })
        }
    };
    match interp.globals.get("_THREAD") {
        Some(Value::Array(items)) => Ok(items
            .get(index as usize)
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn builtin_queue_push(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Queue(q) => {
            q.push(arg(args, 1)?)?;
            Ok(Value::Null)
        }
        other => Err(RuntimeError::TypeError {
            expected: "Queue",
            found: other.type_name(),
        }),
    }
}

fn builtin_queue_pop(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Queue(q) => Ok(q.pop()?),
        other => Err(RuntimeError::TypeError {
            expected: "Queue",
            found: other.type_name(),
        }),
    }
}

fn builtin_queue_size(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Queue(q) => Ok(Value::Int(q.size() as i64)),
        other => Err(RuntimeError::TypeError {
            expected: "Queue",
            found: other.type_name(),
        }),
    }
}

fn builtin_hashtable_write(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match (arg(args, 0)?, arg(args, 1)?) {
        (Value::HashTable(t), Value::Str(key)) => {
            t.insert(key.as_ref(), arg(args, 2)?)?;
            Ok(Value::Null)
        }
        (Value::HashTable(t), Value::Int(key)) => {
            t.insert(*key, arg(args, 2)?)?;
            Ok(Value::Null)
        }
        (Value::HashTable(_), bad_key) => Err(RuntimeError::TypeError {
            expected: "int or string key",
            found: bad_key.type_name(),
        }),
        (other, _) => Err(RuntimeError::TypeError {
            expected: "HashTable",
            found: other.type_name(),
        }),
    }
}

fn builtin_hashtable_read(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match (arg(args, 0)?, arg(args, 1)?) {
        (Value::HashTable(t), Value::Str(key)) => {
            Ok(t.get(key.as_ref())?.unwrap_or(Value::Null))
        }
        (Value::HashTable(t), Value::Int(key)) => Ok(t.get(*key)?.unwrap_or(Value::Null)),
        (Value::HashTable(_), bad_key) => Err(RuntimeError::TypeError {
            expected: "int or string key",
            found: bad_key.type_name(),
        }),
        (other, _) => Err(RuntimeError::TypeError {
            expected: "HashTable",
            found: other.type_name(),
        }),
    }
}

fn builtin_vector_push(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Vector(v) => {
            v.push(arg(args, 1)?)?;
            Ok(Value::Null)
        }
        other => Err(RuntimeError::TypeError {
            expected: "Vector",
            found: other.type_name(),
        }),
    }
}

fn builtin_atomic_inc(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::AtomicInteger(a) => Ok(Value::Int(a.inc())),
        other => Err(RuntimeError::TypeError {
            expected: "AtomicInteger",
            found: other.type_name(),
        }),
    }
}

fn builtin_atomic_get(_: &mut Interpreter, args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::AtomicInteger(a) => Ok(Value::Int(a.get())),
        other => Err(RuntimeError::TypeError {
            expected: "AtomicInteger",
            found: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Param;

    fn str_lit(s: &str) -> Plain {
        Plain::Str(s.to_owned())
    }

    #[test]
    fn evaluates_arithmetic_and_literals() {
        let mut interp = Interpreter::new();
        let mut f = Function::new("calc", "t.script");
        f.literals = vec![Plain::Int(6), Plain::Int(7)];
        f.code = vec![Op::PushLiteral(0), Op::PushLiteral(1), Op::Mul, Op::Return];
        assert_eq!(interp.invoke(&f, None, &[]).unwrap(), Value::Int(42));
    }

    #[test]
    fn integer_overflow_is_an_error_not_a_panic() {
        let mut interp = Interpreter::new();
        let mut f = Function::new("overflow", "t.script");
        f.literals = vec![Plain::Int(i64::MAX), Plain::Int(1)];
        f.code = vec![Op::PushLiteral(0), Op::PushLiteral(1), Op::Add, Op::Return];
        assert_eq!(
            interp.invoke(&f, None, &[]),
            Err(RuntimeError::ArithmeticOverflow)
        );

        let mut g = Function::new("underflow", "t.script");
        g.literals = vec![Plain::Int(i64::MIN), Plain::Int(2)];
        g.code = vec![Op::PushLiteral(0), Op::PushLiteral(1), Op::Mul, Op::Return];
        assert_eq!(
            interp.invoke(&g, None, &[]),
            Err(RuntimeError::ArithmeticOverflow)
        );
    }

    #[test]
    fn missing_args_use_defaults_then_null() {
        let mut interp = Interpreter::new();
        let mut f = Function::new("f", "t.script");
        f.params = vec![
            Param::required("a"),
            Param::optional("b", Plain::Int(10)),
        ];
        f.code = vec![Op::PushArg(0), Op::PushArg(1), Op::Add, Op::Return];
        assert_eq!(
            interp.invoke(&f, None, &[Value::Int(1)]).unwrap(),
            Value::Int(11)
        );
    }

    #[test]
    fn calls_user_and_internal_functions() {
        let mut interp = Interpreter::new();
        let mut double = Function::new("double", "t.script");
        double.params = vec![Param::required("n")];
        double.literals = vec![Plain::Int(2)];
        double.code = vec![Op::PushArg(0), Op::PushLiteral(0), Op::Mul, Op::Return];
        interp.define_function(double);

        let mut main = Function::new("main", "t.script");
        main.literals = vec![Plain::Int(21), str_lit("double"), str_lit("strlen"), str_lit("abc")];
        main.code = vec![
            Op::PushLiteral(0),
            Op::Call { name: 1, argc: 1 },
            Op::PushLiteral(3),
            Op::Call { name: 2, argc: 1 },
            Op::Add,
            Op::Return,
        ];
        assert_eq!(interp.invoke(&main, None, &[]).unwrap(), Value::Int(45));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let mut interp = Interpreter::new();
        assert_eq!(
            interp.call_function("nope", &[]),
            Err(RuntimeError::UnknownFunction("nope".into()))
        );
    }

    #[test]
    fn conditionals_and_loops_execute() {
        // sum = 0; i = 0; while (i < 5) { sum = sum + i; i = i + 1 } return sum
        let mut interp = Interpreter::new();
        let mut f = Function::new("loop", "t.script");
        f.literals = vec![Plain::Int(0), Plain::Int(5), Plain::Int(1)];
        f.code = vec![
            Op::PushLiteral(0),
            Op::StoreLocal(0), // sum
            Op::PushLiteral(0),
            Op::StoreLocal(1), // i
            // 4: loop head
            Op::PushLocal(1),
            Op::PushLiteral(1),
            Op::Lt,
            Op::JumpIfFalse(16),
            Op::PushLocal(0),
            Op::PushLocal(1),
            Op::Add,
            Op::StoreLocal(0),
            Op::PushLocal(1),
            Op::PushLiteral(2),
            Op::Add,
            Op::StoreLocal(1),
            // 16 is past the end only if we jump back first
        ];
        f.code.push(Op::Jump(4));
        f.code.push(Op::PushLocal(0));
        f.code.push(Op::Return);
        // Fix the exit target now that the tail is in place.
        f.code[7] = Op::JumpIfFalse(17);
        assert_eq!(interp.invoke(&f, None, &[]).unwrap(), Value::Int(10));
    }

    #[test]
    fn objects_construct_with_defaults_and_constructor() {
        let mut interp = Interpreter::new();
        let mut class = ClassDef::new("Counter");
        class.default_properties.insert("count".into(), Plain::Int(0));
        let mut ctor = Function::new("__construct", "c.script");
        ctor.params = vec![Param::required("start")];
        ctor.literals = vec![str_lit("count")];
        ctor.code = vec![Op::PushThis, Op::PushArg(0), Op::SetProp(0), Op::Return];
        class.methods.push(ctor);
        let mut bump = Function::new("bump", "c.script");
        bump.literals = vec![str_lit("count"), Plain::Int(1)];
        bump.code = vec![
            Op::PushThis,
            Op::PushThis,
            Op::GetProp(0),
            Op::PushLiteral(1),
            Op::Add,
            Op::SetProp(0),
            Op::PushThis,
            Op::GetProp(0),
            Op::Return,
        ];
        class.methods.push(bump);
        class.magic = crate::MagicSlots::resolve(&class.methods);
        interp.define_class(class);

        let obj = interp.instantiate("Counter", &[Value::Int(5)]).unwrap();
        let Value::Object(obj) = obj else { panic!() };
        assert_eq!(
            interp.call_method(&obj, "bump", &[]).unwrap(),
            Value::Int(6)
        );
        assert_eq!(
            interp.call_method(&obj, "bump", &[]).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn statics_persist_across_calls() {
        let mut interp = Interpreter::new();
        let mut f = Function::new("tick", "t.script");
        f.statics.insert("n".into(), Plain::Int(0));
        f.literals = vec![str_lit("n"), Plain::Int(1)];
        f.code = vec![
            Op::PushStatic(0),
            Op::PushLiteral(1),
            Op::Add,
            Op::StoreStatic(0),
            Op::PushStatic(0),
            Op::Return,
        ];
        interp.define_function(f.clone());
        assert_eq!(interp.call_function("tick", &[]).unwrap(), Value::Int(1));
        assert_eq!(interp.call_function("tick", &[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn method_statics_are_per_class() {
        fn tick_method() -> Function {
            let mut tick = Function::new("tick", "same.script");
            tick.statics.insert("n".into(), Plain::Int(0));
            tick.literals = vec![str_lit("n"), Plain::Int(1)];
            tick.code = vec![
                Op::PushStatic(0),
                Op::PushLiteral(1),
                Op::Add,
                Op::StoreStatic(0),
                Op::PushStatic(0),
                Op::Return,
            ];
            tick
        }

        let mut interp = Interpreter::new();
        for name in ["First", "Second"] {
            let mut class = ClassDef::new(name);
            class.methods.push(tick_method());
            class.magic = crate::MagicSlots::resolve(&class.methods);
            interp.define_class(class);
        }

        let Value::Object(first) = interp.instantiate("First", &[]).unwrap() else {
            panic!()
        };
        let Value::Object(second) = interp.instantiate("Second", &[]).unwrap() else {
            panic!()
        };
        assert_eq!(
            interp.call_method(&first, "tick", &[]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            interp.call_method(&first, "tick", &[]).unwrap(),
            Value::Int(2)
        );
        // Same method name, same source file, different class: the
        // counter starts fresh.
        assert_eq!(
            interp.call_method(&second, "tick", &[]).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn globals_and_constants_resolve() {
        let mut interp = Interpreter::new();
        interp.define_constant("LIMIT", Plain::Int(9));
        interp.globals.insert("flag".into(), Value::Bool(true));
        let mut f = Function::new("f", "t.script");
        f.literals = vec![str_lit("LIMIT"), str_lit("flag"), str_lit("out")];
        f.code = vec![
            Op::PushConst(0),
            Op::StoreGlobal(2),
            Op::PushGlobal(1),
            Op::Return,
        ];
        assert_eq!(interp.invoke(&f, None, &[]).unwrap(), Value::Bool(true));
        assert_eq!(interp.globals.get("out"), Some(&Value::Int(9)));
    }

    #[test]
    fn execute_file_exposes_thread_args() {
        let mut interp = Interpreter::new();
        let mut unit = Function::new("{main}", "/job.script");
        unit.literals = vec![str_lit("_THREAD")];
        unit.code = vec![Op::PushGlobal(0), Op::Return];
        interp.define_unit("/job.script", unit);

        let result = interp
            .execute_file("/job.script", vec![Value::Int(1), Value::str("x")])
            .unwrap();
        assert_eq!(
            result,
            Value::array_of(vec![Value::Int(1), Value::str("x")])
        );
        assert!(interp
            .program()
            .read()
            .included_files
            .contains("/job.script"));
        assert!(matches!(
            interp.execute_file("/missing.script", vec![]),
            Err(RuntimeError::UnknownUnit(_))
        ));
    }

    #[test]
    fn call_value_dispatches_all_callable_shapes() {
        let mut interp = Interpreter::new();
        let mut f = Function::new("f", "t.script");
        f.literals = vec![Plain::Int(1)];
        f.code = vec![Op::PushLiteral(0), Op::Return];
        interp.define_function(f.clone());

        assert_eq!(
            interp.call_value(&Value::str("f"), &[]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            interp
                .call_value(&Value::Closure(Rc::new(f)), &[])
                .unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            interp.call_value(&Value::Int(3), &[]),
            Err(RuntimeError::NotCallable("int"))
        );
    }

    #[test]
    fn child_contexts_replicate_and_stay_isolated() {
        let parent = Interpreter::new();
        let mut f = Function::new("job", "j.script");
        f.literals = vec![Plain::Int(5)];
        f.code = vec![Op::PushLiteral(0), Op::Return];
        parent.define_function(f);
        parent.set_ini("precision", "17");

        let mut child = Interpreter::child_of(parent.program());
        assert_eq!(child.call_function("job", &[]).unwrap(), Value::Int(5));
        assert_eq!(child.program().read().ini["precision"].value, "17");

        // Definitions after the fact flow in neither direction.
        parent.define_function(Function::new("late", "j.script"));
        child.define_function(Function::new("childonly", "j.script"));
        assert!(child.program().read().lookup_function("late").is_none());
        assert!(parent
            .program()
            .read()
            .lookup_function("childonly")
            .is_none());
    }
}
