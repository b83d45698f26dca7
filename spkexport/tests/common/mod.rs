//! Fixture builders: a small protocol-2 pickle encoder and PyTorch
//! checkpoint writers that lay files out the way `torch.save` does.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

/// A Python value to encode.
#[derive(Debug, Clone)]
pub enum Py {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Py>),
    Tuple(Vec<Py>),
    Dict(Vec<(Py, Py)>),
    Global(&'static str, &'static str),
    Reduce(Box<Py>, Vec<Py>),
    PersId(Vec<Py>),
}

pub fn s(v: &str) -> Py {
    Py::Str(v.to_string())
}

pub fn floats(vals: &[f64]) -> Py {
    Py::List(vals.iter().map(|&v| Py::Float(v)).collect())
}

pub fn dict(entries: Vec<(&str, Py)>) -> Py {
    Py::Dict(entries.into_iter().map(|(k, v)| (s(k), v)).collect())
}

pub fn wrapped(embedding: Py) -> Py {
    dict(vec![("embedding", embedding)])
}

/// Encodes `value` as a protocol-2 pickle, the way CPython frames it.
pub fn pickle(value: &Py) -> Vec<u8> {
    let mut out = vec![0x80, 0x02];
    encode(value, &mut out);
    out.push(b'.');
    out
}

fn encode(value: &Py, out: &mut Vec<u8>) {
    match value {
        Py::None => out.push(b'N'),
        Py::Bool(true) => out.push(0x88),
        Py::Bool(false) => out.push(0x89),
        Py::Int(n) if (0..256).contains(n) => {
            out.push(b'K');
            out.push(*n as u8);
        }
        Py::Int(n) if i32::try_from(*n).is_ok() => {
            out.push(b'J');
            out.extend_from_slice(&(*n as i32).to_le_bytes());
        }
        Py::Int(n) => {
            out.push(0x8a);
            out.push(8);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Py::Float(f) => {
            out.push(b'G');
            out.extend_from_slice(&f.to_be_bytes());
        }
        Py::Str(v) => {
            out.push(b'X');
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        Py::List(items) => {
            out.push(b']');
            if !items.is_empty() {
                out.push(b'(');
                items.iter().for_each(|i| encode(i, out));
                out.push(b'e');
            }
        }
        Py::Tuple(items) if items.is_empty() => out.push(b')'),
        Py::Tuple(items) => {
            out.push(b'(');
            items.iter().for_each(|i| encode(i, out));
            out.push(b't');
        }
        Py::Dict(entries) => {
            out.push(b'}');
            if !entries.is_empty() {
                out.push(b'(');
                for (k, v) in entries {
                    encode(k, out);
                    encode(v, out);
                }
                out.push(b'u');
            }
        }
        Py::Global(module, name) => {
            out.push(b'c');
            out.extend_from_slice(module.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        Py::Reduce(callable, args) => {
            encode(callable, out);
            encode(&Py::Tuple(args.clone()), out);
            out.push(b'R');
        }
        Py::PersId(items) => {
            encode(&Py::Tuple(items.clone()), out);
            out.push(b'Q');
        }
    }
}

/// `torch._utils._rebuild_tensor_v2(storage, offset, size, stride, False, OrderedDict())`.
pub fn tensor_ref(storage: Py, offset: i64, size: &[i64], stride: &[i64]) -> Py {
    let ints = |v: &[i64]| Py::Tuple(v.iter().map(|&n| Py::Int(n)).collect());
    Py::Reduce(
        Box::new(Py::Global("torch._utils", "_rebuild_tensor_v2")),
        vec![
            storage,
            Py::Int(offset),
            ints(size),
            ints(stride),
            Py::Bool(false),
            Py::Reduce(Box::new(Py::Global("collections", "OrderedDict")), vec![]),
        ],
    )
}

/// A zip-format persistent storage id.
pub fn storage_ref(storage_type: &'static str, key: &str, numel: i64) -> Py {
    Py::PersId(vec![
        s("storage"),
        Py::Global("torch", storage_type),
        s(key),
        s("cpu"),
        Py::Int(numel),
    ])
}

/// A contiguous 1-D float32 tensor backed by storage `key`.
pub fn f32_tensor(key: &str, len: usize) -> Py {
    tensor_ref(
        storage_ref("FloatStorage", key, len as i64),
        0,
        &[len as i64],
        &[1],
    )
}

pub fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Writes a zip checkpoint with `root` as `archive/data.pkl` and each
/// `(key, bytes)` as `archive/data/{key}`.
pub fn torch_zip(root: &Py, storages: &[(&str, Vec<u8>)]) -> Vec<u8> {
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zw = ZipWriter::new(std::io::Cursor::new(Vec::new()));

    zw.start_file("archive/data.pkl", opts).unwrap();
    zw.write_all(&pickle(root)).unwrap();
    zw.start_file("archive/byteorder", opts).unwrap();
    zw.write_all(b"little").unwrap();
    for (key, bytes) in storages {
        zw.start_file(format!("archive/data/{key}"), opts).unwrap();
        zw.write_all(bytes).unwrap();
    }
    zw.start_file("archive/version", opts).unwrap();
    zw.write_all(b"3\n").unwrap();
    zw.finish().unwrap().into_inner()
}

/// Writes a legacy (`_use_new_zipfile_serialization=False`) checkpoint.
pub fn torch_legacy(root: &Py, storages: &[(&str, Vec<u8>, usize)]) -> Vec<u8> {
    let sys_info = dict(vec![
        ("protocol_version", Py::Int(1001)),
        ("little_endian", Py::Bool(true)),
        (
            "type_sizes",
            dict(vec![
                ("short", Py::Int(2)),
                ("int", Py::Int(4)),
                ("long", Py::Int(4)),
            ]),
        ),
    ]);
    // The magic does not fit an i64, so its 10-byte LONG1 is emitted directly.
    let mut out = vec![0x80, 0x02, 0x8a, 10];
    out.extend_from_slice(&0x1950a86a20f9469cfc6c_u128.to_le_bytes()[..10]);
    out.push(b'.');
    out.extend(pickle(&Py::Int(1001)));
    out.extend(pickle(&sys_info));
    out.extend(pickle(root));
    out.extend(pickle(&Py::List(storages.iter().map(|(k, _, _)| s(k)).collect())));
    for (_, bytes, numel) in storages {
        out.extend_from_slice(&(*numel as i64).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Writes `bytes` to `dir/name` and returns the path.
pub fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A legacy persistent storage id, with `view_metadata` left empty.
pub fn legacy_storage_ref(storage_type: &'static str, key: &str, numel: i64) -> Py {
    Py::PersId(vec![
        s("storage"),
        Py::Global("torch", storage_type),
        s(key),
        s("cpu"),
        Py::Int(numel),
        Py::None,
    ])
}
