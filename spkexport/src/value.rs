//! Execution-free object graph shared by every input decoder.

use std::fmt;

/// A decoded value.
///
/// Pickle streams, PyTorch checkpoints and JSON documents all decode into
/// this tree. `Global` and `Object` record what the source asked for
/// without ever importing or calling anything.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Ordered key/value pairs. Keys are not required to be strings.
    Dict(Vec<(Value, Value)>),
    /// A `module.name` reference, never resolved.
    Global { module: String, name: String },
    /// An inert record of a reduce call.
    Object {
        callable: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
    /// A persistent-id reference left for a container to resolve.
    Persistent(Box<Value>),
    Tensor(Tensor),
}

impl Value {
    /// Returns a short description of the value's type, used in error messages.
    pub fn kind(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Global { module, name } => format!("global({module}.{name})"),
            Value::Object { callable, .. } => match callable.as_ref() {
                Value::Global { module, name } => format!("object({module}.{name})"),
                other => format!("object({})", other.kind()),
            },
            Value::Persistent(_) => "persistent reference".into(),
            Value::Tensor(t) => format!("tensor({}, shape={:?})", t.dtype, t.shape),
        }
    }

    /// Looks up a string key in a `Dict`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries.iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Returns true if this is a `Global` naming `module.name`.
    pub fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Value::Global { module: m, name: n } if m == module && n == name)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    /// Returns the items of a `List` or `Tuple`.
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Value::Int(u as i128)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.into_iter()
                    .map(|(k, v)| (Value::Str(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Element type of a tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    /// Maps a PyTorch storage class name (e.g. `FloatStorage`) to a dtype.
    pub fn from_storage_name(name: &str) -> Option<Self> {
        Some(match name {
            "DoubleStorage" => DType::F64,
            "FloatStorage" => DType::F32,
            "HalfStorage" => DType::F16,
            "BFloat16Storage" => DType::BF16,
            "LongStorage" => DType::I64,
            "IntStorage" => DType::I32,
            "ShortStorage" => DType::I16,
            "CharStorage" => DType::I8,
            "ByteStorage" => DType::U8,
            "BoolStorage" => DType::Bool,
            _ => return None,
        })
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_numeric(self) -> bool {
        self != DType::Bool
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F64 => "float64",
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::I16 => "int16",
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// A materialized tensor.
///
/// `values` holds every element in logical row-major order, so flattening
/// is a no-op. Integer and reduced-precision elements are widened to `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Tensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the elements flattened to one dimension.
    pub fn flatten(&self) -> &[f64] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_describes_objects_by_callable() {
        let v = Value::Object {
            callable: Box::new(Value::Global {
                module: "numpy.core.multiarray".into(),
                name: "_reconstruct".into(),
            }),
            args: Box::new(Value::Tuple(vec![])),
            state: None,
        };
        assert_eq!(v.kind(), "object(numpy.core.multiarray._reconstruct)");
    }

    #[test]
    fn kind_describes_tensors() {
        let t = Tensor {
            dtype: DType::Bool,
            shape: vec![3],
            values: vec![0.0, 1.0, 0.0],
        };
        assert_eq!(Value::Tensor(t).kind(), "tensor(bool, shape=[3])");
    }

    #[test]
    fn json_object_keeps_order() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"zeta": 1, "alpha": [0.5, 2], "mid": null}"#).unwrap();
        let v = Value::from(json);
        let Value::Dict(entries) = v else {
            panic!("expected dict");
        };
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str().unwrap()).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
        assert_eq!(
            entries[1].1,
            Value::List(vec![Value::Float(0.5), Value::Int(2)])
        );
    }

    #[test]
    fn get_finds_string_keys_only() {
        let v = Value::Dict(vec![
            (Value::Int(1), Value::Str("int key".into())),
            (Value::Str("embedding".into()), Value::List(vec![])),
        ]);
        assert_eq!(v.get("embedding"), Some(&Value::List(vec![])));
        assert_eq!(v.get("1"), None);
    }

    #[test]
    fn storage_names_map_to_dtypes() {
        assert_eq!(DType::from_storage_name("FloatStorage"), Some(DType::F32));
        assert_eq!(DType::from_storage_name("BFloat16Storage"), Some(DType::BF16));
        assert_eq!(DType::from_storage_name("ComplexFloatStorage"), None);
        assert_eq!(DType::F16.size(), 2);
        assert!(!DType::Bool.is_numeric());
    }
}
