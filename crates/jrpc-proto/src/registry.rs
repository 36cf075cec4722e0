//! Command schema registry.
//!
//! JSON-RPC 1.0 parameters are positional, so the declaration order of a
//! command's fields is its parameter contract. Each command type describes
//! itself with a [`Shape`]; [`Registry::register`] validates that shape once
//! and stores the arity bounds and parsed defaults used by the codec.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

/// Bit set describing where a command may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UsageFlags(u32);

impl UsageFlags {
    pub const NONE: Self = Self(0);
    /// The command is only available when a wallet is attached.
    pub const WALLET_ONLY: Self = Self(1);
    /// The command is only available over a WebSocket session.
    pub const WEBSOCKET_ONLY: Self = Self(1 << 1);
    /// The command is a server-to-client notification.
    pub const NOTIFICATION: Self = Self(1 << 2);

    const KNOWN: u32 = Self::WALLET_ONLY.0 | Self::WEBSOCKET_ONLY.0 | Self::NOTIFICATION.0;

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    const fn is_valid(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

impl BitOr for UsageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for UsageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0x0");
        }
        let mut parts = Vec::new();
        for (flag, name) in [
            (Self::WALLET_ONLY, "WALLET_ONLY"),
            (Self::WEBSOCKET_ONLY, "WEBSOCKET_ONLY"),
            (Self::NOTIFICATION, "NOTIFICATION"),
        ] {
            if self.contains(flag) {
                parts.push(name.to_string());
            }
        }
        let unknown = self.0 & !Self::KNOWN;
        if unknown != 0 {
            parts.push(format!("0x{unknown:x}"));
        }
        f.write_str(&parts.join("|"))
    }
}

/// Field kinds with no JSON representation. They can still appear in a
/// hand-built descriptor and are rejected at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    Function,
    Channel,
    Complex,
    Interface,
}

/// Wire type of a single command field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    UInt,
    Float,
    String,
    Array(Box<FieldType>),
    Object,
    /// Any JSON value.
    Json,
    /// A field that may be omitted. Nesting is not allowed.
    Optional(Box<FieldType>),
    Unsupported(Unsupported),
}

impl FieldType {
    #[must_use]
    pub fn optional(inner: FieldType) -> Self {
        Self::Optional(Box::new(inner))
    }

    #[must_use]
    pub fn array(inner: FieldType) -> Self {
        Self::Array(Box::new(inner))
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_))
    }

    /// The type a present value must have, with any optional wrapper removed.
    #[must_use]
    pub fn value_type(&self) -> &FieldType {
        match self {
            Self::Optional(inner) => inner,
            other => other,
        }
    }

    fn is_supported(&self) -> bool {
        match self {
            Self::Unsupported(_) => false,
            Self::Optional(inner) => !inner.is_optional() && inner.is_supported(),
            Self::Array(inner) => inner.is_supported(),
            _ => true,
        }
    }

    /// Value a field of this type is filled with when nothing was supplied.
    #[must_use]
    pub fn zero_value(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int | Self::UInt => Value::from(0),
            Self::Float => Value::from(0.0),
            Self::String => Value::String(String::new()),
            Self::Array(_) => Value::Array(Vec::new()),
            Self::Object => Value::Object(Map::new()),
            Self::Optional(inner) => inner.zero_value(),
            Self::Json | Self::Unsupported(_) => Value::Null,
        }
    }

    /// Whether `value` can be decoded into a field of this type.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64(),
            Self::UInt => value.is_u64(),
            Self::Float => value.is_number(),
            Self::String => value.is_string(),
            Self::Array(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
            Self::Object => value.is_object(),
            Self::Json => true,
            Self::Optional(inner) => value.is_null() || inner.accepts(value),
            Self::Unsupported(_) => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int64"),
            Self::UInt => f.write_str("uint64"),
            Self::Float => f.write_str("float64"),
            Self::String => f.write_str("string"),
            Self::Array(inner) => write!(f, "[]{inner}"),
            Self::Object => f.write_str("object"),
            Self::Json => f.write_str("json"),
            Self::Optional(inner) => write!(f, "*{inner}"),
            Self::Unsupported(kind) => match kind {
                Unsupported::Function => f.write_str("func"),
                Unsupported::Channel => f.write_str("chan"),
                Unsupported::Complex => f.write_str("complex128"),
                Unsupported::Interface => f.write_str("interface"),
            },
        }
    }
}

/// Name of the JSON kind of `value`, as used in decode error messages.
#[must_use]
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One positional parameter of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// JSON member name the parameter decodes into. Names starting with `_`
    /// are private.
    pub name: String,
    pub ty: FieldType,
    /// JSON literal used when the parameter is omitted.
    pub default: Option<String>,
    /// Flattened fields have no single position and cannot be registered.
    pub embedded: bool,
}

impl Field {
    #[must_use]
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            embedded: false,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self::required(name, FieldType::optional(ty))
    }

    #[must_use]
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            embedded: true,
            ..Self::required(name, FieldType::Object)
        }
    }

    #[must_use]
    pub fn with_default(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    fn is_exported(&self) -> bool {
        self.name.chars().next().is_some_and(char::is_alphabetic)
    }
}

/// Declared layout of a command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// A named structure with ordered fields.
    Struct(Vec<Field>),
    /// Anything that is not a structure. Never registrable.
    Scalar(FieldType),
}

/// A strongly typed command decodable from positional parameters.
///
/// The serde field names of the implementing type must match the names in
/// its [`Shape`]. An optional field omitted without a default is left out
/// when the type can decode without it, and gets its zero value otherwise.
pub trait Command: DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    fn shape() -> Shape;
}

/// Object-safe view of a decoded command.
pub trait CommandValue: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<C: Command> CommandValue for C {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

pub type BoxedCommand = Box<dyn CommandValue>;

/// Take the concrete command out of a decoded value.
#[must_use]
pub fn downcast<C: Command>(cmd: BoxedCommand) -> Option<C> {
    cmd.into_any().downcast::<C>().ok().map(|cmd| *cmd)
}

#[must_use]
pub fn downcast_ref<C: Command>(cmd: &dyn CommandValue) -> Option<&C> {
    cmd.as_any().downcast_ref::<C>()
}

pub(crate) type DecodeFn = fn(Value) -> serde_json::Result<BoxedCommand>;

fn decode_boxed<C: Command>(value: Value) -> serde_json::Result<BoxedCommand> {
    Ok(Box::new(serde_json::from_value::<C>(value)?))
}

/// Everything the codec needs to know about one registered method.
pub struct MethodInfo {
    pub max_params: usize,
    pub num_req_params: usize,
    /// Parsed defaults keyed by field index.
    pub defaults: HashMap<usize, Value>,
    pub flags: UsageFlags,
    pub fields: Vec<Field>,
    /// Object known to decode: zero values for required fields, plus the
    /// default or fill of every optional field that needs one when omitted.
    pub(crate) sample: Map<String, Value>,
    pub(crate) decode: DecodeFn,
}

impl MethodInfo {
    /// Value used for the omitted optional parameter at `index`, if any.
    pub(crate) fn omitted_value(&self, index: usize) -> Option<&Value> {
        let field = self.fields.get(index)?;
        if field.ty.is_optional() {
            self.sample.get(&field.name)
        } else {
            None
        }
    }
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("max_params", &self.max_params)
            .field("num_req_params", &self.num_req_params)
            .field("defaults", &self.defaults)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Process-scoped table of registered command shapes.
#[derive(Debug, Default)]
pub struct Registry {
    methods: RwLock<HashMap<String, Arc<MethodInfo>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register command type `C` under `method`.
    ///
    /// The shape is fully validated, and checked to decode into `C`, before
    /// the table is touched, so a failed registration leaves the registry
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns a registration-kind [`Error`] describing the first problem found.
    pub fn register<C: Command>(&self, method: &str, flags: UsageFlags) -> Result<()> {
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        if methods.contains_key(method) {
            return Err(Error::new(
                ErrorKind::DuplicateMethod,
                format!("method \"{method}\" is already registered"),
            ));
        }
        if !flags.is_valid() {
            return Err(Error::new(
                ErrorKind::InvalidUsageFlags,
                format!("invalid usage flags specified for method {method}: {flags}"),
            ));
        }

        let fields = match C::shape() {
            Shape::Struct(fields) => fields,
            Shape::Scalar(ty) => {
                return Err(Error::new(
                    ErrorKind::InvalidType,
                    format!("type must be *struct not '{ty}'"),
                ));
            }
        };
        let (num_opt, defaults) = validate_fields(&fields)?;
        let sample = sample_object(&fields, &defaults, decode_boxed::<C>)?;

        let info = MethodInfo {
            max_params: fields.len(),
            num_req_params: fields.len() - num_opt,
            defaults,
            flags,
            fields,
            sample,
            decode: decode_boxed::<C>,
        };
        tracing::trace!(
            "Registered method {} ({}..={} params)",
            method,
            info.num_req_params,
            info.max_params
        );
        methods.insert(method.to_string(), Arc::new(info));
        Ok(())
    }

    /// Look up the stored metadata for `method`.
    #[must_use]
    pub fn method_info(&self, method: &str) -> Option<Arc<MethodInfo>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// # Errors
    ///
    /// Returns `UnregisteredMethod` if nothing is registered under `method`.
    pub fn usage_flags(&self, method: &str) -> Result<UsageFlags> {
        self.method_info(method)
            .map(|info| info.flags)
            .ok_or_else(|| unregistered(method))
    }

    /// One-line usage text, e.g. `getblock "hash" (verbose=true verbosetx=false)`.
    ///
    /// # Errors
    ///
    /// Returns `UnregisteredMethod` if nothing is registered under `method`.
    pub fn usage(&self, method: &str) -> Result<String> {
        let info = self.method_info(method).ok_or_else(|| unregistered(method))?;
        let mut required = Vec::new();
        let mut optional = Vec::new();
        for field in &info.fields {
            let name = field.name.to_lowercase();
            let arg = match field.ty.value_type() {
                FieldType::String => format!("\"{name}\""),
                FieldType::Array(_) => format!("[{name},...]"),
                FieldType::Object | FieldType::Json => format!("{{{name}}}"),
                _ => name,
            };
            if field.ty.is_optional() {
                optional.push(match &field.default {
                    Some(default) => format!("{arg}={default}"),
                    None => arg,
                });
            } else {
                required.push(arg);
            }
        }

        let mut usage = method.to_string();
        if !required.is_empty() {
            usage.push(' ');
            usage.push_str(&required.join(" "));
        }
        if !optional.is_empty() {
            usage.push_str(" (");
            usage.push_str(&optional.join(" "));
            usage.push(')');
        }
        Ok(usage)
    }

    /// All registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

pub(crate) fn unregistered(method: &str) -> Error {
    Error::new(
        ErrorKind::UnregisteredMethod,
        format!("\"{method}\" is not registered"),
    )
}

/// Check a field layout and return the optional field count and parsed defaults.
fn validate_fields(fields: &[Field]) -> Result<(usize, HashMap<usize, Value>)> {
    let mut num_opt = 0;
    let mut defaults = HashMap::new();

    for (index, field) in fields.iter().enumerate() {
        let name = &field.name;
        if field.embedded {
            return Err(Error::new(
                ErrorKind::EmbeddedType,
                format!("embedded fields are not supported (field name: \"{name}\")"),
            ));
        }
        if !field.is_exported() {
            return Err(Error::new(
                ErrorKind::UnexportedField,
                format!("unexported fields are not supported (field name: \"{name}\")"),
            ));
        }

        let optional = field.ty.is_optional();
        if optional {
            num_opt += 1;
        } else if num_opt > 0 {
            return Err(Error::new(
                ErrorKind::NonOptionalField,
                format!(
                    "all fields after the first optional field must also be optional (field name \"{name}\")"
                ),
            ));
        }

        if !field.ty.is_supported() {
            return Err(Error::new(
                ErrorKind::UnsupportedFieldType,
                format!("unsupported field type '{}' (field name \"{name}\")", field.ty),
            ));
        }

        if let Some(literal) = &field.default {
            if !optional {
                return Err(Error::new(
                    ErrorKind::NonOptionalDefault,
                    format!("required fields must not have a default specified (field name \"{name}\")"),
                ));
            }
            let value = serde_json::from_str::<Value>(literal)
                .ok()
                .filter(|value| !value.is_null() && field.ty.value_type().accepts(value))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::MismatchedDefault,
                        format!(
                            "default value of \"{literal}\" is the wrong type (field name \"{name}\")"
                        ),
                    )
                })?;
            defaults.insert(index, value);
        }
    }

    Ok((num_opt, defaults))
}

/// Build an object the command type is known to decode from.
///
/// Every field starts out with its default or zero value. Optional fields
/// without a default are then dropped again one at a time, and keep their
/// zero value only when the type cannot decode without them.
fn sample_object(
    fields: &[Field],
    defaults: &HashMap<usize, Value>,
    decode: DecodeFn,
) -> Result<Map<String, Value>> {
    let mut object: Map<String, Value> = fields
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let value = defaults
                .get(&index)
                .cloned()
                .unwrap_or_else(|| field.ty.zero_value());
            (field.name.clone(), value)
        })
        .collect();

    if let Err(err) = decode(Value::Object(object.clone())) {
        return Err(undecodable_field(fields, &object, decode, &err));
    }

    for (index, field) in fields.iter().enumerate() {
        if !field.ty.is_optional() || defaults.contains_key(&index) {
            continue;
        }
        if let Some(zero) = object.remove(&field.name) {
            if decode(Value::Object(object.clone())).is_err() {
                object.insert(field.name.clone(), zero);
            }
        }
    }
    Ok(object)
}

/// Describe why `object` does not decode, naming the first field whose
/// value alone is at fault when there is one.
fn undecodable_field(
    fields: &[Field],
    object: &Map<String, Value>,
    decode: DecodeFn,
    err: &serde_json::Error,
) -> Error {
    let alternatives = [
        Value::Null,
        Value::Bool(false),
        Value::from(0),
        Value::String(String::new()),
        Value::Array(Vec::new()),
        Value::Object(Map::new()),
    ];
    let culprit = fields.iter().find(|field| {
        alternatives.iter().any(|alternative| {
            let mut candidate = object.clone();
            candidate.insert(field.name.clone(), alternative.clone());
            decode(Value::Object(candidate)).is_ok()
        })
    });

    let Some(field) = culprit else {
        return Error::new(
            ErrorKind::InvalidType,
            format!("type does not match its declared fields: {err}"),
        );
    };
    let name = &field.name;
    match &field.default {
        Some(literal) => Error::new(
            ErrorKind::MismatchedDefault,
            format!("default value of \"{literal}\" does not decode (field name \"{name}\"): {err}"),
        ),
        None => Error::new(
            ErrorKind::InvalidType,
            format!(
                "field does not decode from a {} value (field name \"{name}\"): {err}",
                field.ty.value_type()
            ),
        ),
    }
}
