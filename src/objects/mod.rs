//! Self-describing binary object codec and the stream wrapper around it.
//!
//! A value serializes as a graph of framed elements: integers and byte
//! strings are leaves, composites reference other elements by identifier.
//! Identifiers are interned, so a subvalue appearing several times is
//! written once and decodes back to a shared reference. Element id 0 is the
//! graph root, and a top-level value is wrapped once more as a single BYTES
//! element with id 0 so values can be concatenated into streams.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use thiserror::Error as ThisError;

use crate::stream::ScheduledFile;

mod wire;

pub use self::wire::{
    bytes_to_int, int_to_bytes, marshal_header, parse_header, unpack_preheader, Header, PreHeader,
    TYPE_BYTES, TYPE_INTEGER, TYPE_TUPLE,
};

use self::wire::{marshal, unmarshal, Element, Payload};

/// Codec failure.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("truncated element header")]
    TruncatedHeader,
    #[error("header fields exceed 64 bits")]
    OversizedHeader,
    #[error("payload shorter than declared length")]
    TruncatedPayload,
    #[error("unknown wire type {0}")]
    UnknownType(u8),
    #[error("malformed reference list")]
    MalformedRefs,
    #[error("integer payload out of range")]
    IntegerOutOfRange,
    #[error("unknown composite tag")]
    UnknownTag,
    #[error("no element with id {0}")]
    MissingId(u64),
    #[error("cyclic references are not supported")]
    CyclicReferences,
    #[error("dictionary with a dangling key")]
    DanglingKey,
    #[error("malformed text value")]
    MalformedText(#[source] Option<std::string::FromUtf8Error>),
    #[error("unexpected top-level framing")]
    BadFraming,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A decoded (or to-be-encoded) value.
///
/// Children are `Rc`-shared: decoding a graph in which one subvalue is
/// referenced twice produces two clones of the same `Rc`, observable with
/// [`Rc::ptr_eq`]. `Dict` keeps its pairs in wire order, `Set` its members.
#[derive(Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Tuple(Vec<Rc<Value>>),
    List(Vec<Rc<Value>>),
    Dict(Vec<(Rc<Value>, Rc<Value>)>),
    Set(Vec<Rc<Value>>),
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }
}

const TAG_TUPLE: &[u8] = b"tuple";
const TAG_LIST: &[u8] = b"list";
const TAG_DICT: &[u8] = b"dict";
const TAG_SET: &[u8] = b"set";
const TAG_TEXT: &[u8] = b"unicode";

/// Structural key for values interned by equality. Only shapes whose
/// equality is stable get one; everything else falls back to pointer
/// identity.
#[derive(Debug, PartialEq, Eq, Hash)]
enum InternKey {
    Int(i64),
    Bytes(Vec<u8>),
    Tuple(Vec<InternKey>),
}

fn intern_key(value: &Value) -> Option<InternKey> {
    match value {
        Value::Int(n) => Some(InternKey::Int(*n)),
        Value::Bytes(b) => Some(InternKey::Bytes(b.clone())),
        Value::Tuple(members) => members
            .iter()
            .map(|member| intern_key(member))
            .collect::<Option<Vec<_>>>()
            .map(InternKey::Tuple),
        _ => None,
    }
}

#[derive(Default)]
struct Interner {
    next: u64,
    by_value: HashMap<InternKey, u64>,
    by_identity: HashMap<*const Value, u64>,
}

impl Interner {
    /// Canonical identifier for `value`: equal hashable values share one id,
    /// other values are unique per allocation.
    fn identity(&mut self, value: &Rc<Value>) -> u64 {
        let next = &mut self.next;
        let slot = match intern_key(value) {
            Some(key) => self.by_value.entry(key).or_insert_with(|| {
                let id = *next;
                *next += 1;
                id
            }),
            None => self
                .by_identity
                .entry(Rc::as_ptr(value))
                .or_insert_with(|| {
                    let id = *next;
                    *next += 1;
                    id
                }),
        };
        *slot
    }
}

fn tag(name: &[u8]) -> Rc<Value> {
    Rc::new(Value::Bytes(name.to_vec()))
}

/// Flattens `root` into elements. The root always receives id 0; composite
/// payloads reference a leading tag element naming their container kind,
/// then their members.
fn dump(root: &Rc<Value>) -> Vec<Element> {
    let mut interner = Interner::default();
    let mut elements = Vec::new();
    let mut queue = vec![Rc::clone(root)];
    let mut done = HashSet::new();

    while let Some(value) = queue.pop() {
        let id = interner.identity(&value);
        if !done.insert(id) {
            continue;
        }

        let children: Vec<Rc<Value>> = match &*value {
            Value::Int(n) => {
                elements.push(Element {
                    id,
                    payload: Payload::Integer(*n),
                });
                continue;
            }
            Value::Bytes(b) => {
                elements.push(Element {
                    id,
                    payload: Payload::Bytes(b.clone()),
                });
                continue;
            }
            Value::Text(s) => vec![tag(TAG_TEXT), Rc::new(Value::Bytes(s.as_bytes().to_vec()))],
            Value::Tuple(members) => std::iter::once(tag(TAG_TUPLE))
                .chain(members.iter().cloned())
                .collect(),
            Value::List(members) => std::iter::once(tag(TAG_LIST))
                .chain(members.iter().cloned())
                .collect(),
            Value::Set(members) => std::iter::once(tag(TAG_SET))
                .chain(members.iter().cloned())
                .collect(),
            Value::Dict(pairs) => std::iter::once(tag(TAG_DICT))
                .chain(pairs.iter().flat_map(|(k, v)| [k.clone(), v.clone()]))
                .collect(),
        };

        let refs = children
            .iter()
            .map(|child| interner.identity(child))
            .collect();
        elements.push(Element {
            id,
            payload: Payload::Refs(refs),
        });
        queue.extend(children);
    }
    elements
}

struct Resolver {
    objects: HashMap<u64, Rc<Value>>,
    deferred: HashMap<u64, Vec<u64>>,
    resolving: HashSet<u64>,
}

impl Resolver {
    fn resolve(&mut self, id: u64) -> Result<Rc<Value>, Error> {
        if let Some(value) = self.objects.get(&id) {
            return Ok(Rc::clone(value));
        }
        let refs = self
            .deferred
            .get(&id)
            .cloned()
            .ok_or(Error::MissingId(id))?;
        if !self.resolving.insert(id) {
            // An immutable shared-reference graph cannot represent the
            // cycle we just found on the wire.
            return Err(Error::CyclicReferences);
        }
        let result = self.resolve_composite(&refs);
        self.resolving.remove(&id);
        let value = result?;
        self.objects.insert(id, Rc::clone(&value));
        Ok(value)
    }

    fn resolve_composite(&mut self, refs: &[u64]) -> Result<Rc<Value>, Error> {
        let (&tag_id, members) = refs.split_first().ok_or(Error::UnknownTag)?;
        let tag = self.resolve(tag_id)?;
        let Value::Bytes(tag) = &*tag else {
            return Err(Error::UnknownTag);
        };

        let value = match tag.as_slice() {
            TAG_TUPLE => Value::Tuple(self.resolve_all(members)?),
            TAG_LIST => Value::List(self.resolve_all(members)?),
            TAG_SET => Value::Set(self.resolve_all(members)?),
            TAG_DICT => {
                if members.len() % 2 != 0 {
                    return Err(Error::DanglingKey);
                }
                let mut pairs = Vec::with_capacity(members.len() / 2);
                for pair in members.chunks_exact(2) {
                    pairs.push((self.resolve(pair[0])?, self.resolve(pair[1])?));
                }
                Value::Dict(pairs)
            }
            TAG_TEXT => {
                let [utf8_id] = members else {
                    return Err(Error::MalformedText(None));
                };
                let utf8 = self.resolve(*utf8_id)?;
                let Value::Bytes(utf8) = &*utf8 else {
                    return Err(Error::MalformedText(None));
                };
                let text = String::from_utf8(utf8.clone())
                    .map_err(|err| Error::MalformedText(Some(err)))?;
                Value::Text(text)
            }
            _ => return Err(Error::UnknownTag),
        };
        Ok(Rc::new(value))
    }

    fn resolve_all(&mut self, ids: &[u64]) -> Result<Vec<Rc<Value>>, Error> {
        ids.iter().map(|&id| self.resolve(id)).collect()
    }
}

/// Rebuilds the value graph rooted at element id 0. Resolution is memoised
/// by id, which is what preserves sharing.
fn load(elements: impl IntoIterator<Item = Result<Element, Error>>) -> Result<Rc<Value>, Error> {
    let mut objects = HashMap::new();
    let mut deferred = HashMap::new();
    for element in elements {
        let element = element?;
        match element.payload {
            Payload::Integer(n) => {
                objects.insert(element.id, Rc::new(Value::Int(n)));
            }
            Payload::Bytes(b) => {
                objects.insert(element.id, Rc::new(Value::Bytes(b)));
            }
            Payload::Refs(refs) => {
                deferred.insert(element.id, refs);
            }
        }
    }
    Resolver {
        objects,
        deferred,
        resolving: HashSet::new(),
    }
    .resolve(0)
}

/// Serializes one value, wrapped for streaming.
pub fn dumps(value: &Rc<Value>) -> Vec<u8> {
    dump_stream([value])
}

/// Serializes a sequence of values as a concatenated stream.
pub fn dump_stream<'a>(values: impl IntoIterator<Item = &'a Rc<Value>>) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        let mut inner = Vec::new();
        for element in dump(value) {
            marshal(&mut inner, &element);
        }
        marshal(
            &mut out,
            &Element {
                id: 0,
                payload: Payload::Bytes(inner),
            },
        );
    }
    out
}

/// Deserializes exactly one value.
pub fn loads(data: &[u8]) -> Result<Rc<Value>, Error> {
    let mut values = load_stream(data)?;
    if values.len() != 1 {
        return Err(Error::BadFraming);
    }
    Ok(values.remove(0))
}

/// Deserializes every value of a concatenated stream.
pub fn load_stream(data: &[u8]) -> Result<Vec<Rc<Value>>, Error> {
    let mut values = Vec::new();
    for element in unmarshal(data) {
        let element = element?;
        let Element {
            id: 0,
            payload: Payload::Bytes(inner),
        } = element
        else {
            return Err(Error::BadFraming);
        };
        values.push(load(unmarshal(&inner))?);
    }
    Ok(values)
}

/// A [`ScheduledFile`] carrying framed codec values.
#[derive(Debug)]
pub struct ObjectFile {
    file: ScheduledFile,
}

impl ObjectFile {
    pub fn new(file: ScheduledFile) -> ObjectFile {
        ObjectFile { file }
    }

    /// See [`ScheduledFile::from_socket`].
    pub fn from_socket<S: AsRawFd>(socket: &S) -> io::Result<ObjectFile> {
        ScheduledFile::from_socket(socket).map(ObjectFile::new)
    }

    /// See [`ScheduledFile::connect_tcp`].
    pub async fn connect_tcp(addr: SocketAddr) -> io::Result<ObjectFile> {
        ScheduledFile::connect_tcp(addr).await.map(ObjectFile::new)
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &ScheduledFile {
        &self.file
    }

    /// Reads the next framed value off the stream; `None` on a clean
    /// end-of-file at a frame boundary.
    pub async fn read_object(&self) -> Result<Option<Rc<Value>>, Error> {
        let mut header = self.file.read(1).await?;
        if header.is_empty() {
            return Ok(None);
        }
        let pre = unpack_preheader(header[0]);
        let ext = ((pre.id_size + pre.length_size) / 8) as usize;
        header.extend(self.file.read(ext).await?);
        if header.len() < 1 + ext {
            return Err(Error::UnexpectedEof);
        }
        let (header, _) = parse_header(&header)?;
        if header.id != 0 || header.kind != TYPE_BYTES {
            return Err(Error::BadFraming);
        }

        let data = self.file.read(header.length as usize).await?;
        if (data.len() as u64) < header.length {
            return Err(Error::UnexpectedEof);
        }
        load(unmarshal(&data)).map(Some)
    }

    /// Writes one framed value.
    pub async fn write_object(&self, value: &Rc<Value>) -> Result<(), Error> {
        self.file.write(&dumps(value)).await?;
        Ok(())
    }

    /// Lazy sequence of framed values, ending at end-of-file or the first
    /// decode error.
    pub fn read_object_stream(&self) -> ObjectStream<'_> {
        ObjectStream {
            file: self,
            done: false,
        }
    }
}

/// Sequence returned by [`ObjectFile::read_object_stream`].
#[derive(Debug)]
pub struct ObjectStream<'a> {
    file: &'a ObjectFile,
    done: bool,
}

impl ObjectStream<'_> {
    pub async fn next(&mut self) -> Result<Option<Rc<Value>>, Error> {
        if self.done {
            return Ok(None);
        }
        match self.file.read_object().await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rc(value: Value) -> Rc<Value> {
        Rc::new(value)
    }

    #[test]
    fn atoms_round_trip() {
        for value in [
            Value::Int(0),
            Value::Int(-123456789),
            Value::Bytes(b"hello".to_vec()),
            Value::Bytes(Vec::new()),
            Value::Text("smörgåsbord".to_owned()),
            Value::Text(String::new()),
        ] {
            let value = rc(value);
            assert_eq!(loads(&dumps(&value)).unwrap(), value);
        }
    }

    #[test]
    fn composites_round_trip() {
        let value = rc(Value::Tuple(vec![
            rc(Value::Int(42)),
            rc(Value::Text("asdf".to_owned())),
            rc(Value::List(vec![rc(Value::Text("hehe".to_owned()))])),
        ]));
        let decoded = loads(&dumps(&value)).unwrap();
        assert_eq!(decoded, value);
        let Value::Tuple(members) = &*decoded else {
            panic!("expected a tuple");
        };
        assert!(matches!(&*members[2], Value::List(..)));
    }

    #[test]
    fn dicts_and_sets_round_trip() {
        let value = rc(Value::Dict(vec![
            (rc(Value::Int(1)), rc(Value::Text("one".to_owned()))),
            (
                rc(Value::Bytes(b"k".to_vec())),
                rc(Value::Set(vec![rc(Value::Int(7)), rc(Value::Int(8))])),
            ),
        ]));
        assert_eq!(loads(&dumps(&value)).unwrap(), value);
    }

    #[test]
    fn empty_composites_round_trip() {
        for value in [
            Value::Tuple(Vec::new()),
            Value::List(Vec::new()),
            Value::Dict(Vec::new()),
            Value::Set(Vec::new()),
        ] {
            let value = rc(value);
            assert_eq!(loads(&dumps(&value)).unwrap(), value);
        }
    }

    #[test]
    fn shared_subvalues_decode_to_shared_references() {
        let shared = rc(Value::List(vec![rc(Value::Int(9))]));
        let value = rc(Value::Tuple(vec![shared.clone(), shared]));
        let decoded = loads(&dumps(&value)).unwrap();
        let Value::Tuple(members) = &*decoded else {
            panic!("expected a tuple");
        };
        assert!(Rc::ptr_eq(&members[0], &members[1]));
    }

    #[test]
    fn equal_atoms_are_written_once() {
        let value = rc(Value::List(vec![
            rc(Value::Bytes(b"dup".to_vec())),
            rc(Value::Bytes(b"dup".to_vec())),
        ]));
        let decoded = loads(&dumps(&value)).unwrap();
        let Value::List(members) = &*decoded else {
            panic!("expected a list");
        };
        assert!(Rc::ptr_eq(&members[0], &members[1]));
    }

    #[test]
    fn value_streams_round_trip() {
        let values = [
            rc(Value::Int(1)),
            rc(Value::Text("two".to_owned())),
            rc(Value::List(vec![rc(Value::Int(3))])),
        ];
        let encoded = dump_stream(values.iter());
        assert_eq!(load_stream(&encoded).unwrap(), values);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        // A composite whose tag names a container kind we do not have.
        let mut inner = Vec::new();
        marshal(
            &mut inner,
            &Element {
                id: 0,
                payload: Payload::Refs(vec![1]),
            },
        );
        marshal(
            &mut inner,
            &Element {
                id: 1,
                payload: Payload::Bytes(b"frozenset".to_vec()),
            },
        );
        let mut outer = Vec::new();
        marshal(
            &mut outer,
            &Element {
                id: 0,
                payload: Payload::Bytes(inner),
            },
        );
        assert!(matches!(loads(&outer), Err(Error::UnknownTag)));
    }

    #[test]
    fn missing_root_is_rejected() {
        let mut outer = Vec::new();
        marshal(
            &mut outer,
            &Element {
                id: 0,
                payload: Payload::Bytes(Vec::new()),
            },
        );
        assert!(matches!(loads(&outer), Err(Error::MissingId(0))));
    }

    #[test]
    fn cyclic_references_are_rejected() {
        // id 0 = ('list', id 0): a self-referential container.
        let mut inner = Vec::new();
        marshal(
            &mut inner,
            &Element {
                id: 0,
                payload: Payload::Refs(vec![1, 0]),
            },
        );
        marshal(
            &mut inner,
            &Element {
                id: 1,
                payload: Payload::Bytes(b"list".to_vec()),
            },
        );
        let mut outer = Vec::new();
        marshal(
            &mut outer,
            &Element {
                id: 0,
                payload: Payload::Bytes(inner),
            },
        );
        assert!(matches!(loads(&outer), Err(Error::CyclicReferences)));
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let mut inner = Vec::new();
        marshal(
            &mut inner,
            &Element {
                id: 0,
                payload: Payload::Refs(vec![1, 2]),
            },
        );
        marshal(
            &mut inner,
            &Element {
                id: 1,
                payload: Payload::Bytes(b"unicode".to_vec()),
            },
        );
        marshal(
            &mut inner,
            &Element {
                id: 2,
                payload: Payload::Bytes(vec![0xFF, 0xFE]),
            },
        );
        let mut outer = Vec::new();
        marshal(
            &mut outer,
            &Element {
                id: 0,
                payload: Payload::Bytes(inner),
            },
        );
        assert!(matches!(loads(&outer), Err(Error::MalformedText(..))));
    }
}
