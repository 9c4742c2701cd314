use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{Interpreter, Plain, RuntimeError, Value};

/// One formal parameter. A missing argument falls back to the default
/// when present, `Null` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Class name constraint, checked by the host compiler; carried
    /// through replication untouched.
    pub type_hint: Option<String>,
    pub default: Option<Plain>,
}

impl Param {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            type_hint: None,
            default: None,
        }
    }

    pub fn optional(name: &str, default: Plain) -> Self {
        Self {
            name: name.to_owned(),
            type_hint: None,
            default: Some(default),
        }
    }
}

/// Stack bytecode. Operands index into the function's literal table
/// unless noted; jump targets are absolute instruction indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push a literal by table index.
    PushLiteral(u16),
    /// Push the argument at position `n`, or its default.
    PushArg(u8),
    PushLocal(u8),
    StoreLocal(u8),
    /// Push the receiver of the current method call.
    PushThis,
    /// Push a global variable; operand names it via a string literal.
    PushGlobal(u16),
    StoreGlobal(u16),
    /// Push a function-level static variable by name literal.
    PushStatic(u16),
    StoreStatic(u16),
    /// Push a program constant by name literal.
    PushConst(u16),
    /// Pop an object, push one of its properties by name literal.
    GetProp(u16),
    /// Pop a value, then an object; store the value into the property.
    SetProp(u16),
    Add,
    Sub,
    Mul,
    Lt,
    Eq,
    Jump(u16),
    JumpIfFalse(u16),
    /// Call a free function named by a string literal with `argc`
    /// stacked arguments.
    Call { name: u16, argc: u8 },
    /// Pop `argc` arguments, then the receiver; dispatch by method name.
    CallMethod { name: u16, argc: u8 },
    /// Instantiate a class named by a string literal, running its
    /// constructor with `argc` stacked arguments.
    New { class: u16, argc: u8 },
    Pop,
    Return,
}

/// Compiled function body. Owns everything it references, so a deep
/// clone of a `Function` is safe to hand to another interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// Defining class for methods, `None` for free functions. Keeps
    /// same-named methods of different classes apart, statics included.
    pub owner: Option<String>,
    /// Source file the function was compiled from. Interned per
    /// execution context so functions from one file share one string.
    pub filename: Arc<str>,
    pub params: Vec<Param>,
    pub code: Vec<Op>,
    pub literals: Vec<Plain>,
    /// Compile-time initial values of function-level statics. Runtime
    /// static state lives in the interpreter, not here.
    pub statics: HashMap<String, Plain>,
}

impl Function {
    pub fn new(name: &str, filename: &str) -> Self {
        Self {
            name: name.to_owned(),
            owner: None,
            filename: Arc::from(filename),
            params: Vec::new(),
            code: Vec::new(),
            literals: Vec::new(),
            statics: HashMap::new(),
        }
    }
}

/// Native function: implemented in the host, looked up by name in the
/// child rather than copied into it.
pub type BuiltinFn = fn(&mut Interpreter, &[Value]) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone)]
pub struct InternalFn {
    pub name: String,
    pub handler: BuiltinFn,
}

#[derive(Debug, Clone)]
pub enum FunctionDef {
    User(Function),
    Internal(InternalFn),
}

impl FunctionDef {
    pub fn name(&self) -> &str {
        match self {
            FunctionDef::User(f) => &f.name,
            FunctionDef::Internal(f) => &f.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    User,
    Internal,
}

/// Indices into a class's own method list for the specially-named
/// methods the runtime dispatches directly. Resolved per class, never
/// inherited as indices; lookup falls back to the parent chain by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagicSlots {
    pub constructor: Option<usize>,
    pub destructor: Option<usize>,
    pub run: Option<usize>,
    pub to_string: Option<usize>,
}

impl MagicSlots {
    pub fn resolve(methods: &[Function]) -> Self {
        let mut slots = Self::default();
        for (idx, method) in methods.iter().enumerate() {
            match method.name.to_ascii_lowercase().as_str() {
                "__construct" => slots.constructor = Some(idx),
                "__destruct" => slots.destructor = Some(idx),
                "run" => slots.run = Some(idx),
                "__tostring" => slots.to_string = Some(idx),
                _ => {}
            }
        }
        slots
    }
}

/// Class definition. Links to parents, interfaces and traits are by
/// lowercase name, resolved against the owning context's class table,
/// so a copied class graph can never point back into its source.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub kind: ClassKind,
    /// Original-case name; the class table key is its lowercase form.
    pub name: String,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub traits: Vec<String>,
    pub constants: HashMap<String, Plain>,
    pub default_properties: HashMap<String, Plain>,
    pub methods: Vec<Function>,
    pub magic: MagicSlots,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        Self {
            kind: ClassKind::User,
            name: name.to_owned(),
            parent: None,
            interfaces: Vec::new(),
            traits: Vec::new(),
            constants: HashMap::new(),
            default_properties: HashMap::new(),
            methods: Vec::new(),
            magic: MagicSlots::default(),
        }
    }

    pub fn internal(name: &str) -> Self {
        Self {
            kind: ClassKind::Internal,
            ..Self::new(name)
        }
    }

    /// Case-insensitive lookup among this class's own methods.
    pub fn method(&self, name: &str) -> Option<&Function> {
        self.methods
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct Constant {
    pub name: String,
    pub value: Plain,
}

/// One configuration entry with modification bookkeeping, so a child
/// context can replay only the parent's deliberate overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct IniEntry {
    pub value: String,
    pub modified: bool,
    pub orig_value: Option<String>,
}

impl IniEntry {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_owned(),
            modified: false,
            orig_value: None,
        }
    }
}

/// Everything an interpreter executes against: function, class and
/// constant tables, compiled file bodies, inclusion bookkeeping and
/// configuration. Holds only owned data, so it is `Send + Sync` and a
/// child context can be built from it on another thread.
#[derive(Debug, Clone, Default)]
pub struct ProgramState {
    /// Keyed by lowercase function name.
    pub functions: HashMap<String, FunctionDef>,
    /// Keyed by lowercase class name.
    pub classes: HashMap<String, ClassDef>,
    /// Keyed by exact constant name.
    pub constants: HashMap<String, Constant>,
    /// Compiled top-level bodies of source files, keyed by path.
    pub units: HashMap<String, Function>,
    pub included_files: HashSet<String>,
    pub ini: HashMap<String, IniEntry>,
}

impl ProgramState {
    pub fn lookup_function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(&name.to_ascii_lowercase())
    }

    pub fn lookup_class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(&name.to_ascii_lowercase())
    }

    /// Constant names live in one case-insensitive namespace for the
    /// purpose of collision checks.
    pub fn has_constant_like(&self, name: &str) -> bool {
        self.constants.contains_key(name)
            || self
                .constants
                .keys()
                .any(|existing| existing.eq_ignore_ascii_case(name))
    }

    /// Walks the inheritance chain looking for a method, nearest class
    /// first. Returns the method together with the defining class name.
    pub fn find_method(&self, class: &str, method: &str) -> Option<(&ClassDef, &Function)> {
        let mut current = self.lookup_class(class);
        while let Some(def) = current {
            if let Some(found) = def.method(method) {
                return Some((def, found));
            }
            current = def.parent.as_deref().and_then(|p| self.lookup_class(p));
        }
        None
    }

    /// Default property table for a new instance: parents first, own
    /// defaults override inherited ones.
    pub fn default_properties(&self, class: &str) -> HashMap<String, Plain> {
        let mut chain = Vec::new();
        let mut current = self.lookup_class(class);
        while let Some(def) = current {
            chain.push(def);
            current = def.parent.as_deref().and_then(|p| self.lookup_class(p));
        }
        let mut properties = HashMap::new();
        for def in chain.into_iter().rev() {
            for (name, value) in &def.default_properties {
                properties.insert(name.clone(), value.clone());
            }
        }
        properties
    }
}
