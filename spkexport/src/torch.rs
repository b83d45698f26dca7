//! PyTorch checkpoint containers.
//!
//! Two layouts written by `torch.save` are understood:
//!
//! - **zip** (the default since torch 1.6): `{prefix}/data.pkl` holds the
//!   object graph and `{prefix}/data/{key}` holds each storage's raw bytes.
//! - **legacy** (`_use_new_zipfile_serialization=False`): a magic number,
//!   protocol version and `sys_info` pickle, then the object pickle, then a
//!   pickled list of storage keys followed by each storage as a
//!   little-endian `i64` element count and its raw bytes.
//!
//! In both, tensors appear as `torch._utils._rebuild_tensor_v2(storage,
//! offset, size, stride, ...)` reduce records whose storage argument is a
//! persistent id. [`Rebuilder`] walks the decoded tree and replaces those
//! records with materialized [`Tensor`]s. Nothing is ever executed.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::rc::Rc;

use zip::ZipArchive;

use crate::ExportError;
use crate::pickle::Unpickler;
use crate::value::{DType, Tensor, Value};

/// First object of a legacy checkpoint.
pub const LEGACY_MAGIC: i128 = 0x1950a86a20f9469cfc6c;

/// Second object of a legacy checkpoint.
pub const LEGACY_PROTOCOL: i128 = 1001;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Returns true if `data` starts with a zip local file header.
pub fn is_zip(data: &[u8]) -> bool {
    data.starts_with(ZIP_MAGIC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Raw bytes of one storage.
#[derive(Debug)]
pub struct Storage {
    dtype: DType,
    order: ByteOrder,
    bytes: Vec<u8>,
}

macro_rules! read_as {
    ($t:ty, $bytes:expr, $order:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$t>()];
        buf.copy_from_slice($bytes);
        match $order {
            ByteOrder::Little => <$t>::from_le_bytes(buf),
            ByteOrder::Big => <$t>::from_be_bytes(buf),
        }
    }};
}

impl Storage {
    pub fn new(dtype: DType, order: ByteOrder, bytes: Vec<u8>) -> Result<Self, ExportError> {
        if bytes.len() % dtype.size() != 0 {
            return Err(ExportError::deserialization(format!(
                "{dtype} storage of {} bytes is not a whole number of elements",
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            order,
            bytes,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads element `idx`, widened to `f64`. The caller checks bounds.
    fn get(&self, idx: usize) -> f64 {
        let size = self.dtype.size();
        let b = &self.bytes[idx * size..(idx + 1) * size];
        let order = self.order;
        match self.dtype {
            DType::F64 => read_as!(f64, b, order),
            DType::F32 => read_as!(f32, b, order) as f64,
            DType::F16 => half::f16::from_bits(read_as!(u16, b, order)).to_f64(),
            DType::BF16 => half::bf16::from_bits(read_as!(u16, b, order)).to_f64(),
            DType::I64 => read_as!(i64, b, order) as f64,
            DType::I32 => read_as!(i32, b, order) as f64,
            DType::I16 => read_as!(i16, b, order) as f64,
            DType::I8 => b[0] as i8 as f64,
            DType::U8 => b[0] as f64,
            DType::Bool => (b[0] != 0) as u8 as f64,
        }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<Self, ExportError> {
        let size = self.dtype.size();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                ExportError::deserialization(format!(
                    "storage view [{offset}..+{len}] exceeds {} elements",
                    self.len()
                ))
            })?;
        Ok(Self {
            dtype: self.dtype,
            order: self.order,
            bytes: self.bytes[offset * size..end * size].to_vec(),
        })
    }

    /// Gathers a strided view in logical row-major order.
    pub fn gather(
        &self,
        offset: usize,
        size: &[usize],
        stride: &[usize],
    ) -> Result<Vec<f64>, ExportError> {
        if size.len() != stride.len() {
            return Err(ExportError::deserialization(format!(
                "tensor size {size:?} and stride {stride:?} differ in rank"
            )));
        }
        let overflow = || ExportError::deserialization(format!("tensor size {size:?} overflows"));

        let numel = size
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(overflow)?;
        if numel == 0 {
            return Ok(Vec::new());
        }

        let mut last = offset;
        for (&d, &s) in size.iter().zip(stride) {
            last = (d - 1)
                .checked_mul(s)
                .and_then(|span| last.checked_add(span))
                .ok_or_else(overflow)?;
        }
        if last >= self.len() {
            return Err(ExportError::deserialization(format!(
                "tensor view (offset={offset}, size={size:?}, stride={stride:?}) exceeds storage of {} elements",
                self.len()
            )));
        }

        let ndim = size.len();
        let mut out = Vec::with_capacity(numel);
        let mut idx = vec![0usize; ndim];
        let mut pos = offset;
        loop {
            out.push(self.get(pos));
            // Odometer increment over the multi-index, last axis fastest.
            // `pos` may wrap while an axis rolls over but is back in bounds
            // whenever it is read.
            let mut d = ndim;
            loop {
                if d == 0 {
                    return Ok(out);
                }
                d -= 1;
                idx[d] += 1;
                pos = pos.wrapping_add(stride[d]);
                if idx[d] < size[d] {
                    break;
                }
                pos = pos.wrapping_sub(stride[d].wrapping_mul(size[d]));
                idx[d] = 0;
            }
        }
    }
}

/// Supplies storage bytes by key.
trait StorageSource {
    fn load(&mut self, key: &str, dtype: DType) -> Result<Storage, ExportError>;
}

struct ZipStorages<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    prefix: String,
    order: ByteOrder,
}

impl StorageSource for ZipStorages<'_> {
    fn load(&mut self, key: &str, dtype: DType) -> Result<Storage, ExportError> {
        let name = format!("{}data/{key}", self.prefix);
        let bytes = read_entry(&mut self.archive, &name)?;
        tracing::debug!(entry = %name, bytes = bytes.len(), %dtype, "loaded storage");
        Storage::new(dtype, self.order, bytes)
    }
}

struct LegacyStorages {
    bytes: HashMap<String, Vec<u8>>,
}

impl StorageSource for LegacyStorages {
    fn load(&mut self, key: &str, dtype: DType) -> Result<Storage, ExportError> {
        let bytes = self.bytes.remove(key).ok_or_else(|| {
            ExportError::deserialization(format!("storage {key:?} missing from legacy checkpoint"))
        })?;
        Storage::new(dtype, ByteOrder::Little, bytes)
    }
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, ExportError> {
    let mut file = archive.by_name(name)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Decodes a zip checkpoint into a value tree with tensors materialized.
pub fn read_zip(data: &[u8]) -> Result<Value, ExportError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let pkl = archive
        .file_names()
        .filter(|n| n.ends_with("data.pkl"))
        .min_by_key(|n| n.matches('/').count())
        .map(String::from)
        .ok_or_else(|| ExportError::deserialization("zip archive has no data.pkl"))?;
    let prefix = pkl.trim_end_matches("data.pkl").to_string();
    tracing::debug!(%prefix, "torch zip checkpoint");

    let byteorder = format!("{prefix}byteorder");
    let order = if has_entry(&archive, &byteorder) {
        let bytes = read_entry(&mut archive, &byteorder)?;
        match String::from_utf8_lossy(&bytes).trim() {
            "little" => ByteOrder::Little,
            "big" => ByteOrder::Big,
            other => {
                return Err(ExportError::deserialization(format!(
                    "unknown byteorder {other:?}"
                )));
            }
        }
    } else {
        ByteOrder::Little
    };

    let graph = read_entry(&mut archive, &pkl)?;
    let root = Unpickler::new(&graph).load()?;

    let mut source = ZipStorages {
        archive,
        prefix,
        order,
    };
    Rebuilder::new(&mut source).rebuild(root)
}

fn has_entry(archive: &ZipArchive<Cursor<&[u8]>>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

/// Returns true if `value` is the first object of a legacy checkpoint.
pub fn is_legacy_magic(value: &Value) -> bool {
    matches!(value, Value::Int(n) if *n == LEGACY_MAGIC)
}

/// Decodes a legacy checkpoint. `data` starts at the magic-number pickle.
pub fn read_legacy(data: &[u8]) -> Result<Value, ExportError> {
    let mut up = Unpickler::new(data);

    let magic = up.load()?;
    if !is_legacy_magic(&magic) {
        return Err(ExportError::deserialization(
            "not a legacy torch checkpoint (bad magic number)",
        ));
    }
    match up.load()? {
        Value::Int(LEGACY_PROTOCOL) => {}
        other => {
            return Err(ExportError::deserialization(format!(
                "unsupported legacy torch protocol: {other:?}"
            )));
        }
    }
    let _sys_info = up.load()?;
    let root = up.load()?;
    let keys = up.load()?;

    let mut dtypes = HashMap::new();
    collect_storage_dtypes(&root, &mut dtypes)?;

    let keys = keys
        .as_items()
        .ok_or_else(|| ExportError::deserialization("legacy storage key list is not a list"))?;
    let mut pos = up.position();
    let mut bytes = HashMap::new();
    for key in keys {
        let key = key
            .as_str()
            .ok_or_else(|| ExportError::deserialization("legacy storage key is not a string"))?;
        let dtype = *dtypes.get(key).ok_or_else(|| {
            ExportError::deserialization(format!("legacy storage {key:?} is never referenced"))
        })?;

        let header = data
            .get(pos..pos + 8)
            .ok_or_else(|| ExportError::deserialization("legacy storage header truncated"))?;
        let numel = i64::from_le_bytes(header.try_into().unwrap_or([0; 8]));
        let len = usize::try_from(numel)
            .ok()
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| {
                ExportError::deserialization(format!("legacy storage {key:?} has bad size {numel}"))
            })?;
        pos += 8;
        let raw = pos
            .checked_add(len)
            .and_then(|end| data.get(pos..end))
            .ok_or_else(|| {
                ExportError::deserialization(format!("legacy storage {key:?} truncated"))
            })?;
        pos += len;
        tracing::debug!(key, numel, %dtype, "loaded legacy storage");
        bytes.insert(key.to_string(), raw.to_vec());
    }

    let mut source = LegacyStorages { bytes };
    Rebuilder::new(&mut source).rebuild(root)
}

/// A decoded persistent storage id.
struct StorageRef<'v> {
    key: &'v str,
    dtype: DType,
    /// `(view_key, offset, len)` for legacy storage views.
    view: Option<(&'v str, usize, usize)>,
}

fn parse_storage_ref(pid: &Value) -> Result<StorageRef<'_>, ExportError> {
    let bad = || ExportError::deserialization(format!("unsupported persistent id: {pid:?}"));
    let items = pid.as_items().ok_or_else(bad)?;
    if items.len() < 5 || items[0].as_str() != Some("storage") {
        return Err(bad());
    }
    let dtype = match &items[1] {
        Value::Global { module, name } if module == "torch" => DType::from_storage_name(name)
            .ok_or_else(|| {
                ExportError::deserialization(format!("unsupported storage type torch.{name}"))
            })?,
        other => {
            return Err(ExportError::deserialization(format!(
                "unsupported storage type {}",
                other.kind()
            )));
        }
    };
    let key = items[2].as_str().ok_or_else(bad)?;

    let view = match items.get(5) {
        None | Some(Value::None) => None,
        Some(meta) => {
            let parts = meta.as_items().filter(|p| p.len() == 3).ok_or_else(bad)?;
            let view_key = parts[0].as_str().ok_or_else(bad)?;
            let offset = as_usize(&parts[1]).ok_or_else(bad)?;
            let len = as_usize(&parts[2]).ok_or_else(bad)?;
            Some((view_key, offset, len))
        }
    };

    Ok(StorageRef { key, dtype, view })
}

fn collect_storage_dtypes(
    value: &Value,
    out: &mut HashMap<String, DType>,
) -> Result<(), ExportError> {
    match value {
        Value::Persistent(pid) => {
            let r = parse_storage_ref(pid)?;
            out.insert(r.key.to_string(), r.dtype);
        }
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                collect_storage_dtypes(item, out)?;
            }
        }
        Value::Dict(entries) => {
            for (k, v) in entries {
                collect_storage_dtypes(k, out)?;
                collect_storage_dtypes(v, out)?;
            }
        }
        Value::Object { args, state, .. } => {
            collect_storage_dtypes(args, out)?;
            if let Some(state) = state {
                collect_storage_dtypes(state, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn as_usize(v: &Value) -> Option<usize> {
    v.as_int().and_then(|n| usize::try_from(n).ok())
}

fn as_usize_list(v: &Value) -> Option<Vec<usize>> {
    v.as_items()?.iter().map(as_usize).collect()
}

/// Replaces tensor rebuild records with materialized tensors.
struct Rebuilder<'s> {
    source: &'s mut dyn StorageSource,
    cache: HashMap<String, Rc<Storage>>,
}

impl<'s> Rebuilder<'s> {
    fn new(source: &'s mut dyn StorageSource) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    fn rebuild(&mut self, value: Value) -> Result<Value, ExportError> {
        Ok(match value {
            Value::List(items) => Value::List(self.rebuild_all(items)?),
            Value::Tuple(items) => Value::Tuple(self.rebuild_all(items)?),
            Value::Dict(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((self.rebuild(k)?, self.rebuild(v)?));
                }
                Value::Dict(out)
            }
            Value::Object {
                callable,
                args,
                state,
            } => self.rebuild_object(*callable, *args, state)?,
            other => other,
        })
    }

    fn rebuild_all(&mut self, items: Vec<Value>) -> Result<Vec<Value>, ExportError> {
        items.into_iter().map(|v| self.rebuild(v)).collect()
    }

    fn rebuild_object(
        &mut self,
        callable: Value,
        args: Value,
        state: Option<Box<Value>>,
    ) -> Result<Value, ExportError> {
        const UTILS: &str = "torch._utils";

        if callable.is_global(UTILS, "_rebuild_tensor_v2") || callable.is_global(UTILS, "_rebuild_tensor") {
            return self.rebuild_tensor(&args);
        }
        if callable.is_global(UTILS, "_rebuild_parameter")
            || callable.is_global(UTILS, "_rebuild_parameter_with_state")
        {
            let data = first_arg(args)?;
            return self.rebuild(data);
        }
        if callable.is_global("torch._tensor", "_rebuild_from_type_v2") {
            // (func, type, args, state): rebuild as func(*args).
            let Value::Tuple(mut parts) = args else {
                return Err(ExportError::deserialization("bad _rebuild_from_type_v2 arguments"));
            };
            if parts.len() < 3 {
                return Err(ExportError::deserialization("bad _rebuild_from_type_v2 arguments"));
            }
            let inner_args = parts.swap_remove(2);
            let func = parts.swap_remove(0);
            return self.rebuild_object(func, inner_args, None);
        }

        Ok(Value::Object {
            callable: Box::new(callable),
            args: Box::new(args),
            state,
        })
    }

    fn rebuild_tensor(&mut self, args: &Value) -> Result<Value, ExportError> {
        let bad = |what: &str| ExportError::deserialization(format!("bad tensor rebuild args: {what}"));
        let items = args.as_items().ok_or_else(|| bad("not a tuple"))?;
        if items.len() < 4 {
            return Err(bad("expected at least 4 arguments"));
        }
        let Value::Persistent(pid) = &items[0] else {
            return Err(bad("storage is not a persistent id"));
        };
        let storage = self.storage(pid)?;
        let offset = as_usize(&items[1]).ok_or_else(|| bad("storage offset"))?;
        let size = as_usize_list(&items[2]).ok_or_else(|| bad("size"))?;
        let stride = as_usize_list(&items[3]).ok_or_else(|| bad("stride"))?;

        let values = storage.gather(offset, &size, &stride)?;
        Ok(Value::Tensor(Tensor {
            dtype: storage.dtype,
            shape: size,
            values,
        }))
    }

    fn storage(&mut self, pid: &Value) -> Result<Rc<Storage>, ExportError> {
        let r = parse_storage_ref(pid)?;
        let root = match self.cache.get(r.key) {
            Some(s) => Rc::clone(s),
            None => {
                let s = Rc::new(self.source.load(r.key, r.dtype)?);
                self.cache.insert(r.key.to_string(), Rc::clone(&s));
                s
            }
        };
        if root.dtype != r.dtype {
            return Err(ExportError::deserialization(format!(
                "storage {:?} referenced as both {} and {}",
                r.key, root.dtype, r.dtype
            )));
        }

        let Some((view_key, offset, len)) = r.view else {
            return Ok(root);
        };
        if let Some(s) = self.cache.get(view_key) {
            return Ok(Rc::clone(s));
        }
        let view = Rc::new(root.slice(offset, len)?);
        self.cache.insert(view_key.to_string(), Rc::clone(&view));
        Ok(view)
    }
}

fn first_arg(args: Value) -> Result<Value, ExportError> {
    match args {
        Value::Tuple(items) | Value::List(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| ExportError::deserialization("missing parameter data")),
        _ => Err(ExportError::deserialization("bad parameter rebuild arguments")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_storage(values: &[f32]) -> Storage {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Storage::new(DType::F32, ByteOrder::Little, bytes).unwrap()
    }

    #[test]
    fn gather_contiguous_matrix() {
        let s = f32_storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let got = s.gather(0, &[2, 3], &[3, 1]).unwrap();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn gather_transposed_view() {
        // A 2x3 row-major matrix viewed as its 3x2 transpose.
        let s = f32_storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let got = s.gather(0, &[3, 2], &[1, 3]).unwrap();
        assert_eq!(got, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn gather_row_of_shared_storage() {
        // Second row of a stacked [2, 3] table.
        let s = f32_storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let got = s.gather(3, &[3], &[1]).unwrap();
        assert_eq!(got, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn gather_scalar_and_empty() {
        let s = f32_storage(&[7.5]);
        assert_eq!(s.gather(0, &[], &[]).unwrap(), vec![7.5]);
        assert!(s.gather(0, &[0, 4], &[4, 1]).unwrap().is_empty());
    }

    #[test]
    fn gather_out_of_bounds() {
        let s = f32_storage(&[1.0, 2.0]);
        let err = s.gather(1, &[2], &[1]).unwrap_err();
        assert!(matches!(err, ExportError::Deserialization(_)), "{err}");
    }

    #[test]
    fn gather_ignores_stride_of_unit_axes() {
        let s = f32_storage(&[1.0, 2.0, 3.0]);
        assert_eq!(s.gather(1, &[1], &[usize::MAX]).unwrap(), vec![2.0]);
        assert_eq!(
            s.gather(1, &[1, 2], &[usize::MAX, 1]).unwrap(),
            vec![2.0, 3.0]
        );
        assert_eq!(
            s.gather(0, &[3, 1], &[1, usize::MAX]).unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn decodes_reduced_precision_and_big_endian() {
        let half_bytes = [
            half::f16::from_f32(0.5).to_bits().to_le_bytes(),
            half::f16::from_f32(-2.0).to_bits().to_le_bytes(),
        ]
        .concat();
        let s = Storage::new(DType::F16, ByteOrder::Little, half_bytes).unwrap();
        assert_eq!(s.gather(0, &[2], &[1]).unwrap(), vec![0.5, -2.0]);

        let be = 1.25f32.to_be_bytes().to_vec();
        let s = Storage::new(DType::F32, ByteOrder::Big, be).unwrap();
        assert_eq!(s.gather(0, &[1], &[1]).unwrap(), vec![1.25]);

        let bf = half::bf16::from_f32(3.0).to_bits().to_le_bytes().to_vec();
        let s = Storage::new(DType::BF16, ByteOrder::Little, bf).unwrap();
        assert_eq!(s.gather(0, &[1], &[1]).unwrap(), vec![3.0]);
    }

    #[test]
    fn ragged_storage_is_rejected() {
        let err = Storage::new(DType::F32, ByteOrder::Little, vec![0; 6]).unwrap_err();
        assert!(matches!(err, ExportError::Deserialization(_)), "{err}");
    }

    #[test]
    fn storage_ref_rejects_unknown_types() {
        let pid = Value::Tuple(vec![
            Value::Str("storage".into()),
            Value::Global {
                module: "torch".into(),
                name: "ComplexFloatStorage".into(),
            },
            Value::Str("0".into()),
            Value::Str("cpu".into()),
            Value::Int(4),
        ]);
        let err = parse_storage_ref(&pid).err().unwrap();
        assert!(err.to_string().contains("ComplexFloatStorage"), "{err}");
    }
}
