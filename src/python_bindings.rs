//! Python bindings for the call tracer
//!
//! This module exposes the tracer to Python drivers using PyO3. A driver
//! builds code blocks from protobuf bytes, wraps functions around them and
//! feeds the tracer one notification at a time, capturing the frame's code,
//! instruction offset and operand stack in a `Frame`.

use std::sync::Arc;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};

use crate::code::CodeBlock;
use crate::error::TraceError;
use crate::frame::FrameSnapshot;
use crate::instrument;
use crate::program::Program;
use crate::tracer::{CallTracer, TraceEvent, TraceKind, TracerOptions};
use crate::value::{Function, HostObject, KeywordArgs, NativeFunction, Value};

fn to_py_err(e: TraceError) -> PyErr {
    if e.is_fatal() {
        PyRuntimeError::new_err(e.to_string())
    } else {
        PyValueError::new_err(e.to_string())
    }
}

/// An immutable compiled code block
#[pyclass(name = "CodeBlock", frozen)]
#[derive(Clone)]
struct PyCodeBlock {
    inner: Arc<CodeBlock>,
}

#[pymethods]
impl PyCodeBlock {
    /// Deserialize a code block tree from protobuf bytes
    ///
    /// Raises:
    ///     ValueError: If the bytes are not a valid program
    #[staticmethod]
    fn from_bytes(data: &[u8]) -> PyResult<Self> {
        Program::from_proto_bytes(data)
            .map(|program| PyCodeBlock {
                inner: program.code,
            })
            .map_err(to_py_err)
    }

    /// Serialize the code block tree to protobuf bytes
    fn to_bytes<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        let bytes = Program::new(self.inner.clone()).to_proto_bytes();
        PyBytes::new(py, &bytes)
    }

    #[getter]
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[getter]
    fn code<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.code)
    }

    #[getter]
    fn line_table<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, self.inner.line_table.as_bytes())
    }

    #[getter]
    fn first_line(&self) -> u32 {
        self.inner.first_line
    }

    /// `(offset, line)` pairs where a new source line starts
    fn line_starts(&self) -> Vec<(usize, u32)> {
        self.inner.line_table.line_starts(self.inner.first_line)
    }

    fn is_instrumented(&self) -> bool {
        instrument::is_instrumented(&self.inner)
    }

    fn __repr__(&self) -> String {
        format!(
            "<CodeBlock name='{}' bytes={} instrumented={}>",
            self.inner.name,
            self.inner.code.len(),
            self.is_instrumented()
        )
    }
}

/// A function implemented in bytecode
#[pyclass(name = "Function", frozen)]
struct PyFunction {
    inner: Arc<Function>,
}

#[pymethods]
impl PyFunction {
    #[new]
    fn new(name: String, code: &PyCodeBlock) -> Self {
        PyFunction {
            inner: Function::new(name, code.inner.clone()),
        }
    }

    #[getter]
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// The code block the next call will execute
    #[getter]
    fn code(&self) -> PyCodeBlock {
        PyCodeBlock {
            inner: self.inner.code(),
        }
    }

    fn __repr__(&self) -> String {
        format!("<Function {}>", self.inner.name())
    }
}

/// A function implemented outside the interpreter
#[pyclass(name = "NativeFunction", frozen)]
struct PyNativeFunction {
    inner: Arc<NativeFunction>,
}

#[pymethods]
impl PyNativeFunction {
    #[new]
    fn new(name: String) -> Self {
        PyNativeFunction {
            inner: NativeFunction::new(name),
        }
    }

    #[getter]
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn __repr__(&self) -> String {
        format!("<NativeFunction {}>", self.inner.name())
    }
}

/// Convert a Python object to a Value
///
/// Objects with no counterpart are carried as opaque values and come back
/// unchanged in events. Python callables become functions so the tracer can
/// classify them: those with a `__code__` object run in the interpreter and
/// report their own frames, everything else is native.
fn py_to_value(obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    if obj.is_none() {
        return Ok(Value::None);
    }
    // bool before int: bool is an int subclass
    if let Ok(b) = obj.extract::<bool>() {
        return Ok(Value::Bool(b));
    }
    if obj.is_instance_of::<PyInt>() {
        if let Ok(i) = obj.extract::<i64>() {
            return Ok(Value::Int(i));
        }
    }
    if obj.is_instance_of::<PyFloat>() {
        return Ok(Value::Float(obj.extract::<f64>()?));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(Value::String(s.to_str()?.to_string()));
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        let items = tuple
            .iter()
            .map(|item| py_to_value(&item))
            .collect::<PyResult<Vec<_>>>()?;
        return Ok(Value::Tuple(items));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        let items = list
            .iter()
            .map(|item| py_to_value(&item))
            .collect::<PyResult<Vec<_>>>()?;
        return Ok(Value::List(items));
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut entries = KeywordArgs::new();
        let mut string_keys = true;
        for (key, value) in dict.iter() {
            match key.extract::<String>() {
                Ok(key) => {
                    entries.insert(key, py_to_value(&value)?);
                }
                Err(_) => {
                    string_keys = false;
                    break;
                }
            }
        }
        if string_keys {
            return Ok(Value::Dict(entries));
        }
    }
    if let Ok(function) = obj.downcast::<PyFunction>() {
        return Ok(Value::Function(function.get().inner.clone()));
    }
    if let Ok(native) = obj.downcast::<PyNativeFunction>() {
        return Ok(Value::Native(native.get().inner.clone()));
    }
    if obj.is_callable() {
        let name = obj
            .getattr("__name__")
            .and_then(|name| name.extract::<String>())
            .unwrap_or_else(|_| "<callable>".to_string());
        let host: HostObject = Arc::new(obj.clone().unbind());
        if obj.hasattr("__code__")? {
            // An empty block counts as instrumented, so the tracer leaves it alone
            let code = Arc::new(CodeBlock::new(name.clone(), Vec::new()));
            return Ok(Value::Function(Function::with_host(name, code, host)));
        }
        return Ok(Value::Native(NativeFunction::with_host(name, host)));
    }

    Ok(Value::Object(Arc::new(obj.clone().unbind())))
}

/// The Python object a host-backed value was created from
fn host_to_py<'py>(py: Python<'py>, host: Option<&HostObject>) -> Option<Bound<'py, PyAny>> {
    host?
        .downcast_ref::<Py<PyAny>>()
        .map(|obj| obj.bind(py).clone())
}

/// Convert a Value back to a Python object
fn value_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    match value {
        Value::None => Ok(py.None().into_bound(py)),
        Value::Bool(b) => Ok(PyBool::new(py, *b).as_any().clone()),
        Value::Int(i) => Ok(PyInt::new(py, *i).into_any()),
        Value::Float(f) => Ok(PyFloat::new(py, *f).into_any()),
        Value::String(s) => Ok(PyString::new(py, s).into_any()),
        Value::Tuple(items) => {
            let items = items
                .iter()
                .map(|item| value_to_py(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(PyTuple::new(py, items)?.into_any())
        }
        Value::List(items) => {
            let items = items
                .iter()
                .map(|item| value_to_py(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(PyList::new(py, items)?.into_any())
        }
        Value::Dict(entries) => Ok(kwargs_to_py(py, entries)?.into_any()),
        Value::Function(function) => match host_to_py(py, function.host()) {
            Some(obj) => Ok(obj),
            None => Ok(Bound::new(
                py,
                PyFunction {
                    inner: function.clone(),
                },
            )?
            .into_any()),
        },
        Value::Native(native) => match host_to_py(py, native.host()) {
            Some(obj) => Ok(obj),
            None => Ok(Bound::new(
                py,
                PyNativeFunction {
                    inner: native.clone(),
                },
            )?
            .into_any()),
        },
        Value::Object(object) => host_to_py(py, Some(object))
            .ok_or_else(|| PyRuntimeError::new_err("object did not originate from Python")),
    }
}

fn kwargs_to_py<'py>(py: Python<'py>, entries: &KeywordArgs) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (key, value) in entries {
        dict.set_item(key, value_to_py(py, value)?)?;
    }
    Ok(dict)
}

/// Convert an event to the `(name, payload)` tuple handed to Python
fn event_to_py<'py>(py: Python<'py>, event: &TraceEvent) -> PyResult<Bound<'py, PyTuple>> {
    let (name, payload) = match event {
        TraceEvent::NativeCall {
            callee,
            positional,
            keyword,
        } => {
            let args = positional
                .iter()
                .map(|arg| value_to_py(py, arg))
                .collect::<PyResult<Vec<_>>>()?;
            let payload = PyTuple::new(
                py,
                [
                    value_to_py(py, callee)?,
                    PyList::new(py, args)?.into_any(),
                    kwargs_to_py(py, keyword)?.into_any(),
                ],
            )?;
            ("native_call", payload.into_any())
        }
        TraceEvent::NativeReturn { value } => ("native_return", value_to_py(py, value)?),
        TraceEvent::OutputStatement { kind } => ("output", PyString::new(py, kind.as_str()).into_any()),
    };
    PyTuple::new(py, [PyString::new(py, name).into_any(), payload])
}

/// A frame captured at one notification
#[pyclass(name = "Frame", frozen)]
struct PyFrame {
    inner: FrameSnapshot,
}

#[pymethods]
impl PyFrame {
    /// Args:
    ///     code: Code block the frame is executing
    ///     last_instruction: Offset of the instruction about to run
    ///     stack: The frame's operand stack, bottom first
    #[new]
    fn new(
        code: &PyCodeBlock,
        last_instruction: usize,
        stack: Vec<Bound<'_, PyAny>>,
    ) -> PyResult<Self> {
        let stack = stack
            .iter()
            .map(py_to_value)
            .collect::<PyResult<Vec<_>>>()?;
        Ok(PyFrame {
            inner: FrameSnapshot::new(code.inner.clone(), last_instruction, stack),
        })
    }

    #[getter]
    fn code(&self) -> PyCodeBlock {
        PyCodeBlock {
            inner: self.inner.code.clone(),
        }
    }

    #[getter]
    fn last_instruction(&self) -> usize {
        self.inner.last_instruction
    }

    /// The captured operand stack, bottom first
    #[getter]
    fn stack<'py>(&self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyAny>>> {
        self.inner
            .stack
            .iter()
            .map(|value| value_to_py(py, value))
            .collect()
    }

    fn __repr__(&self) -> String {
        format!(
            "<Frame {} @{} stack={}>",
            self.inner.code.name,
            self.inner.last_instruction,
            self.inner.stack.len()
        )
    }
}

/// Classifies trace notifications of one interpreter thread
///
/// Example:
///     >>> tracer = CallTracer()
///     >>> tracer.trace(Frame(code, 0, []), "call")
///     >>> tracer.trace(Frame(code, 0, [NativeFunction("len"), "abc"]), "line")
///     ('native_call', (<NativeFunction len>, ['abc'], {}))
#[pyclass(name = "CallTracer")]
struct PyCallTracer {
    inner: CallTracer,
}

#[pymethods]
impl PyCallTracer {
    #[new]
    #[pyo3(signature = (instrument_arguments=true, instrument_callees=true))]
    fn new(instrument_arguments: bool, instrument_callees: bool) -> Self {
        let options = TracerOptions::default()
            .instrument_arguments(instrument_arguments)
            .instrument_callees(instrument_callees);
        PyCallTracer {
            inner: CallTracer::with_options(options),
        }
    }

    /// Classify one notification
    ///
    /// Args:
    ///     frame: The frame the notification is about
    ///     event: One of "line", "call", "return", "exception"
    ///
    /// Returns:
    ///     tuple or None: The classified event
    ///
    /// Raises:
    ///     RuntimeError: If the notification stream is inconsistent
    ///     ValueError: If the event name or the stack contents are invalid
    fn trace<'py>(
        &mut self,
        py: Python<'py>,
        frame: &PyFrame,
        event: &str,
    ) -> PyResult<Option<Bound<'py, PyTuple>>> {
        let kind = TraceKind::from_name(event)
            .ok_or_else(|| PyValueError::new_err(format!("unknown trace event: {}", event)))?;

        match self.inner.trace(&frame.inner, kind).map_err(to_py_err)? {
            Some(event) => event_to_py(py, &event).map(Some),
            None => Ok(None),
        }
    }

    /// Current nesting depth of interpreted frames and native calls
    #[getter]
    fn depth(&self) -> usize {
        self.inner.depth()
    }

    fn __repr__(&self) -> String {
        format!("<CallTracer depth={}>", self.inner.depth())
    }
}

/// Instrumented copy of a code block, or None if it already is
#[pyfunction]
fn rewrite(code: &PyCodeBlock) -> Option<PyCodeBlock> {
    instrument::rewrite(&code.inner).map(|inner| PyCodeBlock { inner })
}

/// Whether a code block and everything nested in it is instrumented
#[pyfunction]
fn is_instrumented(code: &PyCodeBlock) -> bool {
    instrument::is_instrumented(&code.inner)
}

/// Point a function at an instrumented copy of its code
#[pyfunction]
fn instrument_function(function: &PyFunction) -> bool {
    instrument::instrument_function(&function.inner)
}

/// Python module definition
#[pymodule]
fn _nativetrace(m: &Bound<'_, pyo3::types::PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(rewrite, m)?)?;
    m.add_function(wrap_pyfunction!(is_instrumented, m)?)?;
    m.add_function(wrap_pyfunction!(instrument_function, m)?)?;

    m.add_class::<PyCodeBlock>()?;
    m.add_class::<PyFunction>()?;
    m.add_class::<PyNativeFunction>()?;
    m.add_class::<PyFrame>()?;
    m.add_class::<PyCallTracer>()?;

    m.add("WIRE_FORMAT_VERSION", crate::WIRE_FORMAT_VERSION)?;

    Ok(())
}
