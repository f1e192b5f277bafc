use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::code::CodeBlock;

/// Keyword arguments in the order they were supplied
pub type KeywordArgs = IndexMap<String, Value>;

/// Object owned by the host runtime, carried through untouched
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// Runtime value of the traced VM, as seen on an operand stack
///
/// Primitives and containers are modelled directly. Anything the tracer only
/// needs to carry around (loop iterators, exception sentinels, host objects)
/// is an opaque [`Value::Object`].
#[derive(Clone)]
pub enum Value {
    /// None/null value
    None,

    /// Boolean value
    Bool(bool),

    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point number
    Float(f64),

    /// UTF-8 string
    String(String),

    /// Immutable sequence, the shape of a `*args` expansion
    Tuple(Vec<Value>),

    /// Mutable sequence; a caller's list is expanded by `*args` as it is
    List(Vec<Value>),

    /// String-keyed mapping, the shape of a `**kwargs` expansion
    Dict(KeywordArgs),

    /// Function implemented in bytecode
    Function(Arc<Function>),

    /// Function implemented outside the interpreter loop
    Native(Arc<NativeFunction>),

    /// Host object the tracer never looks inside
    Object(HostObject),
}

impl Value {
    /// Wrap an arbitrary host object
    pub fn object<T: Any + Send + Sync>(object: T) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Whether calling this value is meaningful
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Try to extract a string from this value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the type name of this value for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(l), Value::Bool(r)) => l == r,
            (Value::Int(l), Value::Int(r)) => l == r,
            (Value::Float(l), Value::Float(r)) => l == r,
            (Value::String(l), Value::String(r)) => l == r,
            (Value::Tuple(l), Value::Tuple(r)) => l == r,
            (Value::List(l), Value::List(r)) => l == r,
            (Value::Dict(l), Value::Dict(r)) => l == r,
            (Value::Function(l), Value::Function(r)) => Arc::ptr_eq(l, r),
            (Value::Native(l), Value::Native(r)) => Arc::ptr_eq(l, r),
            // Compare data pointers only; vtable pointers are not unique
            (Value::Object(l), Value::Object(r)) => {
                std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(r))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(fl) => write!(f, "Float({})", fl),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Dict(entries) => f.debug_tuple("Dict").field(entries).finish(),
            Value::Function(function) => write!(f, "Function({})", function.name()),
            Value::Native(native) => write!(f, "Native({})", native.name()),
            Value::Object(_) => write!(f, "Object(<opaque>)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Function(function) => write!(f, "<function {}>", function.name()),
            Value::Native(native) => write!(f, "<built-in function {}>", native.name()),
            Value::Object(_) => write!(f, "<object>"),
        }
    }
}

// Implement From for easy construction
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl From<KeywordArgs> for Value {
    fn from(entries: KeywordArgs) -> Self {
        Value::Dict(entries)
    }
}

impl From<Arc<Function>> for Value {
    fn from(function: Arc<Function>) -> Self {
        Value::Function(function)
    }
}

impl From<Arc<NativeFunction>> for Value {
    fn from(native: Arc<NativeFunction>) -> Self {
        Value::Native(native)
    }
}

/// A function implemented in bytecode
///
/// The code block reference is the only mutable part: instrumentation builds
/// a replacement block and swaps it in, frames already running keep the
/// block they started with.
pub struct Function {
    name: String,
    code: RwLock<Arc<CodeBlock>>,
    host: Option<HostObject>,
}

impl Function {
    pub fn new(name: impl Into<String>, code: Arc<CodeBlock>) -> Arc<Self> {
        Arc::new(Function {
            name: name.into(),
            code: RwLock::new(code),
            host: None,
        })
    }

    /// A function backed by a host object, e.g. the runtime's own function
    pub fn with_host(name: impl Into<String>, code: Arc<CodeBlock>, host: HostObject) -> Arc<Self> {
        Arc::new(Function {
            name: name.into(),
            code: RwLock::new(code),
            host: Some(host),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> Option<&HostObject> {
        self.host.as_ref()
    }

    /// The code block the next call will execute
    pub fn code(&self) -> Arc<CodeBlock> {
        self.code.read().clone()
    }

    /// Replace the code block if it is still `expected`
    ///
    /// Returns false when another thread swapped it first.
    pub fn replace_code(&self, expected: &Arc<CodeBlock>, replacement: Arc<CodeBlock>) -> bool {
        let mut code = self.code.write();
        if !Arc::ptr_eq(&code, expected) {
            return false;
        }
        *code = replacement;
        true
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("code", &self.code().name)
            .finish()
    }
}

/// A function the interpreter calls into without executing bytecode
#[derive(Debug)]
pub struct NativeFunction {
    name: String,
    host: Option<HostObject>,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(NativeFunction {
            name: name.into(),
            host: None,
        })
    }

    /// A native callable backed by a host object
    pub fn with_host(name: impl Into<String>, host: HostObject) -> Arc<Self> {
        Arc::new(NativeFunction {
            name: name.into(),
            host: Some(host),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host object this callable stands for, if any
    pub fn host(&self) -> Option<&HostObject> {
        self.host.as_ref()
    }
}
