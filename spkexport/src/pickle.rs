//! Restricted pickle decoder.
//!
//! Decodes pickle protocols 0-5 into a [`Value`] tree without importing or
//! calling anything. `GLOBAL` and `STACK_GLOBAL` produce inert
//! [`Value::Global`] references; `REDUCE`, `NEWOBJ` and `BUILD` produce inert
//! [`Value::Object`] records. The only callable the decoder interprets itself
//! is `collections.OrderedDict`, which becomes a plain `Dict` so that the
//! `SETITEMS` that follow can populate it.
//!
//! Memo entries keep shared identity while decoding: a container stored with
//! `PUT` and mutated afterwards is seen mutated by every later `GET`, and a
//! `GET` never copies payload. The final tree is frozen with a depth limit,
//! a node budget and a payload budget. The depth limit rejects
//! self-referential graphs. The budgets reject memo amplification: strings
//! and bytes may expand past the input size by at most
//! [`MAX_PAYLOAD_EXPANSION`] bytes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::value::Value;

/// Maximum nesting depth of a frozen value tree.
pub const MAX_DEPTH: usize = 256;

/// Maximum number of nodes produced while freezing one pickle.
pub const MAX_NODES: usize = 1 << 24;

/// Bytes of string and bytes payload a frozen pickle may hold beyond its
/// own encoded size.
pub const MAX_PAYLOAD_EXPANSION: usize = 1 << 26;

/// Highest supported pickle protocol.
pub const HIGHEST_PROTOCOL: u8 = 5;

/// Errors returned by the pickle decoder.
#[derive(Debug, Error)]
pub enum PickleError {
    #[error("pickle truncated at offset {0}")]
    Truncated(usize),

    #[error("unsupported pickle opcode 0x{op:02x} at offset {offset}")]
    UnsupportedOpcode { op: u8, offset: usize },

    #[error("pickle stack underflow at offset {0}")]
    StackUnderflow(usize),

    #[error("pickle MARK not found at offset {0}")]
    MissingMark(usize),

    #[error("pickle memo key {0} not found")]
    MissingMemo(u64),

    #[error("invalid pickle data at offset {offset}: {msg}")]
    Invalid { offset: usize, msg: String },

    #[error("pickle nesting deeper than {} levels (cyclic object graph?)", MAX_DEPTH)]
    TooDeep,

    #[error("pickle expands past its size budget ({} nodes, {} extra payload bytes)", MAX_NODES, MAX_PAYLOAD_EXPANSION)]
    TooLarge,

    #[error("pickle ended without STOP")]
    MissingStop,
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

/// Decode-time node. Containers are shared so memo references observe
/// later mutation.
#[derive(Clone)]
enum Item {
    Plain(Rc<Value>),
    List(Rc<RefCell<Vec<Item>>>),
    Tuple(Rc<Vec<Item>>),
    Dict(Rc<RefCell<Vec<(Item, Item)>>>),
    Object(Rc<RefCell<ObjectItem>>),
    Persistent(Rc<Item>),
}

struct ObjectItem {
    callable: Item,
    args: Item,
    state: Option<Item>,
}

impl Item {
    fn list(items: Vec<Item>) -> Self {
        Item::List(Rc::new(RefCell::new(items)))
    }

    fn dict(entries: Vec<(Item, Item)>) -> Self {
        Item::Dict(Rc::new(RefCell::new(entries)))
    }

    fn kind(&self) -> &'static str {
        match self {
            Item::Plain(_) => "scalar",
            Item::List(_) => "list",
            Item::Tuple(_) => "tuple",
            Item::Dict(_) => "dict",
            Item::Object(_) => "object",
            Item::Persistent(_) => "persistent reference",
        }
    }
}

/// Decodes one pickle from the start of `data`. Trailing bytes are ignored.
pub fn from_slice(data: &[u8]) -> Result<Value, PickleError> {
    Unpickler::new(data).load()
}

/// A streaming decoder over a byte slice.
///
/// [`Unpickler::load`] may be called repeatedly to decode consecutive pickles;
/// [`Unpickler::position`] reports where the next byte after the last `STOP`
/// is, for containers that interleave raw data with pickles.
pub struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Item>,
    marks: Vec<usize>,
    memo: HashMap<u64, Item>,
}

impl<'a> Unpickler<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    /// Returns the current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decodes the next pickle up to and including its `STOP` opcode.
    pub fn load(&mut self) -> Result<Value, PickleError> {
        self.stack.clear();
        self.marks.clear();
        self.memo.clear();

        loop {
            let offset = self.pos;
            let Some(&code) = self.data.get(self.pos) else {
                return Err(PickleError::MissingStop);
            };
            self.pos += 1;

            match code {
                op::PROTO => {
                    let proto = self.read_u8()?;
                    if proto > HIGHEST_PROTOCOL {
                        return Err(self.invalid(offset, format!("unsupported protocol {proto}")));
                    }
                }
                op::FRAME => {
                    // Frames only group opcodes; their contents follow inline.
                    self.read_u64()?;
                }
                op::STOP => {
                    let top = self.pop(offset)?;
                    let mut budget = Budget::for_input(self.data.len());
                    let value = freeze(&top, 0, &mut budget)?;
                    self.stack.clear();
                    self.marks.clear();
                    self.memo.clear();
                    return Ok(value);
                }

                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop(offset)?;
                }
                op::POP_MARK => {
                    self.pop_mark(offset)?;
                }
                op::DUP => {
                    let top = self.top(offset)?.clone();
                    self.stack.push(top);
                }

                op::NONE => self.push_plain(Value::None),
                op::NEWTRUE => self.push_plain(Value::Bool(true)),
                op::NEWFALSE => self.push_plain(Value::Bool(false)),
                op::INT => {
                    let line = self.read_line()?;
                    let value = match line {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        s => Value::Int(parse_int(s).ok_or_else(|| {
                            self.invalid(offset, format!("bad INT literal {s:?}"))
                        })?),
                    };
                    self.push_plain(value);
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let digits = line.strip_suffix('L').unwrap_or(line);
                    let n = parse_int(digits)
                        .ok_or_else(|| self.invalid(offset, format!("bad LONG literal {line:?}")))?;
                    self.push_plain(Value::Int(n));
                }
                op::BININT => {
                    let n = i32::from_le_bytes(self.read_array()?);
                    self.push_plain(Value::Int(n as i128));
                }
                op::BININT1 => {
                    let n = self.read_u8()?;
                    self.push_plain(Value::Int(n as i128));
                }
                op::BININT2 => {
                    let n = u16::from_le_bytes(self.read_array()?);
                    self.push_plain(Value::Int(n as i128));
                }
                op::LONG1 => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.take(len)?;
                    let n = decode_long(bytes)
                        .ok_or_else(|| self.invalid(offset, format!("LONG1 of {len} bytes")))?;
                    self.push_plain(Value::Int(n));
                }
                op::LONG4 => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.take(len)?;
                    let n = decode_long(bytes)
                        .ok_or_else(|| self.invalid(offset, format!("LONG4 of {len} bytes")))?;
                    self.push_plain(Value::Int(n));
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let f: f64 = line
                        .parse()
                        .map_err(|_| self.invalid(offset, format!("bad FLOAT literal {line:?}")))?;
                    self.push_plain(Value::Float(f));
                }
                op::BINFLOAT => {
                    let f = f64::from_be_bytes(self.read_array()?);
                    self.push_plain(Value::Float(f));
                }

                op::STRING => {
                    let line = self.read_line()?;
                    let bytes = unescape_string(line)
                        .ok_or_else(|| self.invalid(offset, format!("bad STRING literal {line:?}")))?;
                    self.push_plain(bytes_or_str(&bytes));
                }
                op::BINSTRING => {
                    let len = self.read_i32_len(offset)?;
                    let bytes = self.take(len)?;
                    self.push_plain(bytes_or_str(bytes));
                }
                op::SHORT_BINSTRING => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.take(len)?;
                    self.push_plain(bytes_or_str(bytes));
                }
                op::UNICODE => {
                    let line = self.read_line_bytes()?;
                    let s = decode_raw_unicode_escape(line)
                        .ok_or_else(|| self.invalid(offset, "bad UNICODE escape".to_string()))?;
                    self.push_plain(Value::Str(s));
                }
                op::SHORT_BINUNICODE => {
                    let len = self.read_u8()? as usize;
                    let s = self.read_utf8(len, offset)?;
                    self.push_plain(Value::Str(s));
                }
                op::BINUNICODE => {
                    let len = self.read_u32()? as usize;
                    let s = self.read_utf8(len, offset)?;
                    self.push_plain(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let len = self.read_u64_len(offset)?;
                    let s = self.read_utf8(len, offset)?;
                    self.push_plain(Value::Str(s));
                }
                op::SHORT_BINBYTES => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.take(len)?.to_vec();
                    self.push_plain(Value::Bytes(bytes));
                }
                op::BINBYTES => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.take(len)?.to_vec();
                    self.push_plain(Value::Bytes(bytes));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = self.read_u64_len(offset)?;
                    let bytes = self.take(len)?.to_vec();
                    self.push_plain(Value::Bytes(bytes));
                }

                op::EMPTY_LIST => self.stack.push(Item::list(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Item::list(items));
                }
                op::APPEND => {
                    let item = self.pop(offset)?;
                    self.extend_list(offset, vec![item])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark(offset)?;
                    self.extend_list(offset, items)?;
                }

                op::EMPTY_TUPLE => self.stack.push(Item::Tuple(Rc::new(Vec::new()))),
                op::TUPLE => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Item::Tuple(Rc::new(items)));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (code - op::TUPLE1 + 1) as usize;
                    let floor = self.marks.last().copied().unwrap_or(0);
                    if self.stack.len() < floor + n {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Item::Tuple(Rc::new(items)));
                }

                op::EMPTY_DICT => self.stack.push(Item::dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark(offset)?;
                    let entries = pairs(items).ok_or_else(|| {
                        self.invalid(offset, "DICT with odd number of items".to_string())
                    })?;
                    self.stack.push(Item::dict(entries));
                }
                op::SETITEM => {
                    let value = self.pop(offset)?;
                    let key = self.pop(offset)?;
                    self.extend_dict(offset, vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark(offset)?;
                    let entries = pairs(items).ok_or_else(|| {
                        self.invalid(offset, "SETITEMS with odd number of items".to_string())
                    })?;
                    self.extend_dict(offset, entries)?;
                }

                // Sets carry no order guarantee; they are kept as lists.
                op::EMPTY_SET => self.stack.push(Item::list(Vec::new())),
                op::ADDITEMS => {
                    let items = self.pop_mark(offset)?;
                    self.extend_list(offset, items)?;
                }
                op::FROZENSET => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Item::list(items));
                }

                op::GLOBAL => {
                    let module = self.read_line()?.to_string();
                    let name = self.read_line()?.to_string();
                    self.push_plain(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop_str(offset)?;
                    let module = self.pop_str(offset)?;
                    self.push_plain(Value::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop(offset)?;
                    let callable = self.pop(offset)?;
                    let item = reduce(callable, args);
                    self.stack.push(item);
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop(offset)?;
                    let args = self.pop(offset)?;
                    let callable = self.pop(offset)?;
                    let item = reduce(callable, args);
                    self.stack.push(item);
                }
                op::BUILD => {
                    let state = self.pop(offset)?;
                    self.build(offset, state)?;
                }

                op::PERSID => {
                    let pid = Item::Plain(Rc::new(Value::Str(self.read_line()?.to_string())));
                    self.stack.push(Item::Persistent(Rc::new(pid)));
                }
                op::BINPERSID => {
                    let pid = self.pop(offset)?;
                    self.stack.push(Item::Persistent(Rc::new(pid)));
                }

                op::PUT => {
                    let key = self.read_memo_key_line(offset)?;
                    self.memoize(offset, key)?;
                }
                op::BINPUT => {
                    let key = self.read_u8()? as u64;
                    self.memoize(offset, key)?;
                }
                op::LONG_BINPUT => {
                    let key = self.read_u32()? as u64;
                    self.memoize(offset, key)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u64;
                    self.memoize(offset, key)?;
                }
                op::GET => {
                    let key = self.read_memo_key_line(offset)?;
                    self.recall(key)?;
                }
                op::BINGET => {
                    let key = self.read_u8()? as u64;
                    self.recall(key)?;
                }
                op::LONG_BINGET => {
                    let key = self.read_u32()? as u64;
                    self.recall(key)?;
                }

                // INST, OBJ, EXT*, out-of-band buffers and anything unknown.
                other => {
                    return Err(PickleError::UnsupportedOpcode { op: other, offset });
                }
            }
        }
    }

    fn invalid(&self, offset: usize, msg: String) -> PickleError {
        PickleError::Invalid { offset, msg }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let data: &'a [u8] = self.data;
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= data.len())
            .ok_or(PickleError::Truncated(self.pos))?;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u32(&mut self) -> Result<u32, PickleError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, PickleError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_i32_len(&mut self, offset: usize) -> Result<usize, PickleError> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| self.invalid(offset, format!("negative length {len}")))
    }

    fn read_u64_len(&mut self, offset: usize) -> Result<usize, PickleError> {
        let len = self.read_u64()?;
        usize::try_from(len).map_err(|_| self.invalid(offset, format!("length {len} too large")))
    }

    fn read_line_bytes(&mut self) -> Result<&'a [u8], PickleError> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::Truncated(self.pos))?;
        let line = &rest[..nl];
        self.pos += nl + 1;
        Ok(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn read_line(&mut self) -> Result<&'a str, PickleError> {
        let start = self.pos;
        let line = self.read_line_bytes()?;
        std::str::from_utf8(line).map_err(|_| PickleError::Invalid {
            offset: start,
            msg: "line is not UTF-8".into(),
        })
    }

    fn read_utf8(&mut self, len: usize, offset: usize) -> Result<String, PickleError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| self.invalid(offset, "string is not UTF-8".to_string()))
    }

    fn read_memo_key_line(&mut self, offset: usize) -> Result<u64, PickleError> {
        let line = self.read_line()?;
        line.parse()
            .map_err(|_| self.invalid(offset, format!("bad memo key {line:?}")))
    }

    fn push_plain(&mut self, value: Value) {
        self.stack.push(Item::Plain(Rc::new(value)));
    }

    fn pop(&mut self, offset: usize) -> Result<Item, PickleError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() <= floor {
            return Err(PickleError::StackUnderflow(offset));
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(offset))
    }

    fn top(&self, offset: usize) -> Result<&Item, PickleError> {
        self.stack.last().ok_or(PickleError::StackUnderflow(offset))
    }

    fn pop_mark(&mut self, offset: usize) -> Result<Vec<Item>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(offset))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(offset));
        }
        Ok(self.stack.split_off(mark))
    }

    fn pop_str(&mut self, offset: usize) -> Result<String, PickleError> {
        let kind = match self.pop(offset)? {
            Item::Plain(v) => match Rc::unwrap_or_clone(v) {
                Value::Str(s) => return Ok(s),
                other => other.kind(),
            },
            other => other.kind().to_string(),
        };
        Err(self.invalid(offset, format!("STACK_GLOBAL expects strings, got {kind}")))
    }

    fn extend_list(&mut self, offset: usize, items: Vec<Item>) -> Result<(), PickleError> {
        match self.top(offset)? {
            Item::List(list) => {
                list.borrow_mut().extend(items);
                Ok(())
            }
            other => Err(self.invalid(offset, format!("cannot append to {}", other.kind()))),
        }
    }

    fn extend_dict(&mut self, offset: usize, entries: Vec<(Item, Item)>) -> Result<(), PickleError> {
        match self.top(offset)? {
            Item::Dict(dict) => {
                dict.borrow_mut().extend(entries);
                Ok(())
            }
            other => Err(self.invalid(offset, format!("cannot set items on {}", other.kind()))),
        }
    }

    fn build(&mut self, offset: usize, state: Item) -> Result<(), PickleError> {
        match self.top(offset)? {
            Item::Object(obj) => {
                obj.borrow_mut().state = Some(state);
            }
            Item::Dict(dict) => match state {
                Item::Dict(extra) => {
                    let extra = extra.borrow().clone();
                    dict.borrow_mut().extend(extra);
                }
                other => {
                    tracing::warn!(offset, state = other.kind(), "BUILD state ignored for dict");
                }
            },
            other => {
                tracing::warn!(offset, target = other.kind(), "BUILD state ignored");
            }
        }
        Ok(())
    }

    fn memoize(&mut self, offset: usize, key: u64) -> Result<(), PickleError> {
        let top = self.top(offset)?.clone();
        self.memo.insert(key, top);
        Ok(())
    }

    fn recall(&mut self, key: u64) -> Result<(), PickleError> {
        let item = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(item);
        Ok(())
    }
}

/// Interprets `callable(*args)` without calling anything.
fn reduce(callable: Item, args: Item) -> Item {
    if let Item::Plain(global) = &callable {
        if global.is_global("collections", "OrderedDict") {
            // OrderedDict() or OrderedDict([(k, v), ...]).
            return Item::dict(ordered_dict_entries(&args));
        }
    }
    Item::Object(Rc::new(RefCell::new(ObjectItem {
        callable,
        args,
        state: None,
    })))
}

fn ordered_dict_entries(args: &Item) -> Vec<(Item, Item)> {
    let Item::Tuple(args) = args else {
        return Vec::new();
    };
    let Some(Item::List(pairs)) = args.first() else {
        return Vec::new();
    };
    pairs
        .borrow()
        .iter()
        .filter_map(|p| match p {
            Item::Tuple(kv) if kv.len() == 2 => Some((kv[0].clone(), kv[1].clone())),
            _ => None,
        })
        .collect()
}

fn pairs(items: Vec<Item>) -> Option<Vec<(Item, Item)>> {
    if items.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Some(out)
}

/// What a single [`freeze`] may still produce.
struct Budget {
    nodes: usize,
    payload: usize,
}

impl Budget {
    fn for_input(len: usize) -> Self {
        Budget {
            nodes: MAX_NODES,
            payload: len.saturating_add(MAX_PAYLOAD_EXPANSION),
        }
    }

    fn node(&mut self) -> Result<(), PickleError> {
        self.nodes = self.nodes.checked_sub(1).ok_or(PickleError::TooLarge)?;
        Ok(())
    }

    fn payload(&mut self, value: &Value) -> Result<(), PickleError> {
        let bytes = match value {
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
            _ => return Ok(()),
        };
        self.payload = self.payload.checked_sub(bytes).ok_or(PickleError::TooLarge)?;
        Ok(())
    }
}

fn freeze(item: &Item, depth: usize, budget: &mut Budget) -> Result<Value, PickleError> {
    if depth > MAX_DEPTH {
        return Err(PickleError::TooDeep);
    }
    budget.node()?;

    let freeze_all = |items: &[Item], budget: &mut Budget| -> Result<Vec<Value>, PickleError> {
        items
            .iter()
            .map(|i| freeze(i, depth + 1, budget))
            .collect()
    };

    Ok(match item {
        Item::Plain(v) => {
            budget.payload(v)?;
            Value::clone(v)
        }
        Item::List(list) => Value::List(freeze_all(&list.borrow(), budget)?),
        Item::Tuple(items) => Value::Tuple(freeze_all(items, budget)?),
        Item::Dict(dict) => {
            let dict = dict.borrow();
            let mut entries = Vec::with_capacity(dict.len());
            for (k, v) in dict.iter() {
                entries.push((freeze(k, depth + 1, budget)?, freeze(v, depth + 1, budget)?));
            }
            Value::Dict(entries)
        }
        Item::Object(obj) => {
            let obj = obj.borrow();
            Value::Object {
                callable: Box::new(freeze(&obj.callable, depth + 1, budget)?),
                args: Box::new(freeze(&obj.args, depth + 1, budget)?),
                state: match &obj.state {
                    Some(s) => Some(Box::new(freeze(s, depth + 1, budget)?)),
                    None => None,
                },
            }
        }
        Item::Persistent(pid) => Value::Persistent(Box::new(freeze(pid, depth + 1, budget)?)),
    })
}

/// Decodes a little-endian two's complement integer of up to 16 bytes.
fn decode_long(bytes: &[u8]) -> Option<i128> {
    if bytes.len() > 16 {
        return None;
    }
    let mut n: i128 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        n |= (b as i128) << (8 * i);
    }
    let len = bytes.len();
    if len > 0 && len < 16 && bytes[len - 1] & 0x80 != 0 {
        n -= 1i128 << (8 * len);
    }
    Some(n)
}

fn parse_int(s: &str) -> Option<i128> {
    s.trim().parse().ok()
}

/// Decodes a quoted `STRING` argument, a byte string literal in `repr` form.
fn unescape_string(line: &str) -> Option<Vec<u8>> {
    let inner = line
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| line.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?
        .as_bytes();

    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        if inner[i] != b'\\' {
            out.push(inner[i]);
            i += 1;
            continue;
        }
        let esc = *inner.get(i + 1)?;
        i += 2;
        match esc {
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'x' => {
                out.push(hex_value(inner.get(i..i + 2)?)? as u8);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut n = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match inner.get(i) {
                        Some(&d @ b'0'..=b'7') => n = n * 8 + u32::from(d - b'0'),
                        _ => break,
                    }
                    i += 1;
                    digits += 1;
                }
                out.push(u8::try_from(n).ok()?);
            }
            other => out.extend_from_slice(&[b'\\', other]),
        }
    }
    Some(out)
}

/// Decodes a `UNICODE` argument in `raw-unicode-escape` form: bytes are
/// latin-1 except for `\uXXXX` and `\UXXXXXXXX` escapes.
fn decode_raw_unicode_escape(line: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let width = match (line[i], line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (b, _) => {
                out.push(char::from(b));
                i += 1;
                continue;
            }
        };
        let code = hex_value(line.get(i + 2..i + 2 + width)?)?;
        out.push(char::from_u32(code)?);
        i += 2 + width;
    }
    Some(out)
}

fn hex_value(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |n, &d| {
        let v = char::from(d).to_digit(16)?;
        n.checked_mul(16)?.checked_add(v)
    })
}

/// Python 2 `str` payloads become text: UTF-8 when valid, latin-1 otherwise.
fn bytes_or_str(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::Str(s.to_string()),
        Err(_) => Value::Str(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::Str(v.into())
    }

    #[test]
    fn dict_of_list_protocol2() {
        // pickle.dumps({'a': [1.0, 2]}, protocol=2)
        let data = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(G?\xf0\x00\x00\x00\x00\x00\x00K\x02es.";
        let v = from_slice(data).unwrap();
        assert_eq!(
            v,
            Value::Dict(vec![(
                s("a"),
                Value::List(vec![Value::Float(1.0), Value::Int(2)])
            )])
        );
    }

    #[test]
    fn protocol0_text_opcodes() {
        // pickle.dumps({'x': (1, 2.5, True)}, protocol=0)
        let data = b"(dp0\nVx\np1\n(I1\nF2.5\nI01\ntp2\ns.";
        let v = from_slice(data).unwrap();
        assert_eq!(
            v,
            Value::Dict(vec![(
                s("x"),
                Value::Tuple(vec![Value::Int(1), Value::Float(2.5), Value::Bool(true)])
            )])
        );
    }

    #[test]
    fn memo_shares_mutated_containers() {
        // a = [1]; pickle.dumps({'x': a, 'y': a}, protocol=2)
        let data = b"\x80\x02}q\x00(X\x01\x00\x00\x00xq\x01]q\x02K\x01aX\x01\x00\x00\x00yq\x03h\x02u.";
        let v = from_slice(data).unwrap();
        let list = Value::List(vec![Value::Int(1)]);
        assert_eq!(v.get("x"), Some(&list));
        assert_eq!(v.get("y"), Some(&list));
    }

    #[test]
    fn self_referential_list_is_rejected() {
        // l = []; l.append(l); pickle.dumps(l, protocol=2)
        let data = b"\x80\x02]q\x00h\x00a.";
        let err = from_slice(data).unwrap_err();
        assert!(matches!(err, PickleError::TooDeep), "{err}");
    }

    #[test]
    fn ordered_dict_reduce_becomes_dict() {
        let data = b"\x80\x02ccollections\nOrderedDict\nq\x00)Rq\x01X\x01\x00\x00\x00aq\x02K\x01s.";
        let v = from_slice(data).unwrap();
        assert_eq!(v, Value::Dict(vec![(s("a"), Value::Int(1))]));
    }

    #[test]
    fn unknown_reduce_stays_inert() {
        let data = b"\x80\x02cos\nsystem\nX\x02\x00\x00\x00ls\x85R.";
        let v = from_slice(data).unwrap();
        assert_eq!(v.kind(), "object(os.system)");
        let Value::Object { args, .. } = v else {
            panic!("expected object");
        };
        assert_eq!(*args, Value::Tuple(vec![s("ls")]));
    }

    #[test]
    fn stack_global_protocol4() {
        let data = b"\x80\x04\x8c\x0bcollections\x94\x8c\x0bOrderedDict\x94\x93\x94)R\x94.";
        let v = from_slice(data).unwrap();
        assert_eq!(v, Value::Dict(vec![]));
    }

    #[test]
    fn long1_decodes_torch_magic() {
        let data = b"\x80\x02\x8a\nl\xfc\x9cF\xf9 j\xa8P\x19.";
        let v = from_slice(data).unwrap();
        assert_eq!(v, Value::Int(0x1950a86a20f9469cfc6c));
    }

    #[test]
    fn long1_negative() {
        assert_eq!(decode_long(&[0xff]), Some(-1));
        assert_eq!(decode_long(&[0x00, 0x80]), Some(-32768));
        assert_eq!(decode_long(&[]), Some(0));
        assert_eq!(decode_long(&[0u8; 17]), None);
    }

    #[test]
    fn inst_opcode_is_rejected() {
        let data = b"(ios\nsystem\nS'ls'\n.";
        let err = from_slice(data).unwrap_err();
        assert!(
            matches!(err, PickleError::UnsupportedOpcode { op: b'i', .. }),
            "{err}"
        );
    }

    #[test]
    fn truncated_length_prefix() {
        let data = b"\x80\x02X\xff\x00\x00\x00abc";
        let err = from_slice(data).unwrap_err();
        assert!(matches!(err, PickleError::Truncated(_)), "{err}");
    }

    #[test]
    fn missing_stop() {
        let err = from_slice(b"\x80\x02K\x01").unwrap_err();
        assert!(matches!(err, PickleError::MissingStop), "{err}");
    }

    #[test]
    fn consecutive_pickles() {
        let data = b"\x80\x02K\x01.\x80\x02K\x02.tail";
        let mut up = Unpickler::new(data);
        assert_eq!(up.load().unwrap(), Value::Int(1));
        assert_eq!(up.load().unwrap(), Value::Int(2));
        assert_eq!(&data[up.position()..], b"tail");
    }

    #[test]
    fn persistent_id_is_kept() {
        let data = b"\x80\x02X\x01\x00\x00\x000\x85Q.";
        let v = from_slice(data).unwrap();
        assert_eq!(v, Value::Persistent(Box::new(Value::Tuple(vec![s("0")]))));
    }

    #[test]
    fn protocol0_unicode_escapes() {
        // pickle.dumps({'说话人A': [1.0]}, protocol=0)
        let data = b"(dp0\nV\\u8bf4\\u8bdd\\u4ebaA\np1\n(lp2\nF1.0\nas.";
        let v = from_slice(data).unwrap();
        assert_eq!(
            v,
            Value::Dict(vec![(s("说话人A"), Value::List(vec![Value::Float(1.0)]))])
        );

        assert_eq!(from_slice(b"V\\U0001f600 caf\xe9\n.").unwrap(), s("😀 café"));
        assert_eq!(from_slice(b"Va\\u005cb\\u000a\n.").unwrap(), s("a\\b\n"));
        assert!(from_slice(b"V\\u12\n.").is_err());
        assert!(from_slice(b"V\\ud800\n.").is_err());
    }

    #[test]
    fn protocol0_string_escapes() {
        assert_eq!(from_slice(b"S'caf\\xe9'\np0\n.").unwrap(), s("café"));
        assert_eq!(from_slice(b"S'caf\\xc3\\xa9'\n.").unwrap(), s("café"));
        assert_eq!(from_slice(b"S\"it's\\n\"\n.").unwrap(), s("it's\n"));
        assert_eq!(from_slice(b"S'\\\\\\'\\101\\0'\n.").unwrap(), s("\\'A\0"));
        assert!(from_slice(b"S'\\x4'\n.").is_err());
        assert!(from_slice(b"S'unterminated\n.").is_err());
    }

    #[test]
    fn memo_amplification_is_rejected() {
        // One 64 KiB string, stored once and fetched 2047 more times.
        let mut data = b"\x80\x02](X\x00\x00\x01\x00".to_vec();
        data.extend_from_slice(&vec![b'a'; 1 << 16]);
        data.extend_from_slice(b"q\x00");
        for _ in 0..2047 {
            data.extend_from_slice(b"h\x00");
        }
        data.extend_from_slice(b"e.");
        let err = from_slice(&data).unwrap_err();
        assert!(matches!(err, PickleError::TooLarge), "{err}");
    }

    #[test]
    fn modest_sharing_is_allowed() {
        let mut data = b"\x80\x02](X\x00\x00\x01\x00".to_vec();
        data.extend_from_slice(&vec![b'a'; 1 << 16]);
        data.extend_from_slice(b"q\x00");
        for _ in 0..15 {
            data.extend_from_slice(b"h\x00");
        }
        data.extend_from_slice(b"e.");
        match from_slice(&data).unwrap() {
            Value::List(items) => assert_eq!(items.len(), 16),
            other => panic!("expected list, got {other:?}"),
        }
    }
}
