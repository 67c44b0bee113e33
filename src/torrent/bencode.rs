//! Bencode codec
//!
//! Decoded values remember the byte range they came from, so the exact
//! source bytes of a sub-value (the `info` dictionary) can be hashed.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;

use crate::error::TorrentError;

/// Containers nested deeper than this are rejected
const MAX_DEPTH: usize = 64;

/// The shape of a bencoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

/// A bencoded value and the source bytes it was decoded from
///
/// Values built in code have an empty span.
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub span: Range<usize>,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Value {}

impl Value {
    fn new(kind: ValueKind) -> Self {
        Self { kind, span: 0..0 }
    }

    pub fn int(value: i64) -> Self {
        Self::new(ValueKind::Int(value))
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::new(ValueKind::Bytes(value.into()))
    }

    pub fn list(values: Vec<Value>) -> Self {
        Self::new(ValueKind::List(values))
    }

    pub fn dict(entries: BTreeMap<Vec<u8>, Value>) -> Self {
        Self::new(ValueKind::Dict(entries))
    }

    /// Dictionary from `(key, value)` pairs
    pub fn dict_from<K: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.kind {
            ValueKind::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            ValueKind::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, lossily
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match &self.kind {
            ValueKind::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match &self.kind {
            ValueKind::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

fn error_at(message: &str, pos: usize) -> anyhow::Error {
    TorrentError::parse_error_with_source(message, format!("bencode offset {}", pos)).into()
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| error_at("unexpected end of data", self.pos))
    }

    /// Digits up to `terminator`, with an optional leading minus
    fn number(&mut self, terminator: u8, signed: bool) -> Result<i64> {
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == terminator)
            .map(|p| start + p)
            .ok_or_else(|| error_at("unterminated number", start))?;
        let text = &self.data[start..end];

        let digits = match text.split_first() {
            Some((b'-', rest)) if signed => rest,
            _ => text,
        };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(error_at("invalid number", start));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(error_at("number has leading zeros", start));
        }
        if digits.len() != text.len() && digits == b"0" {
            return Err(error_at("negative zero", start));
        }

        // all ASCII digits with an optional sign, so this is valid UTF-8
        let value = std::str::from_utf8(text)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| error_at("number out of range", start))?;
        self.pos = end + 1;
        Ok(value)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(error_at("nesting too deep", self.pos));
        }
        let start = self.pos;
        let kind = match self.peek()? {
            b'i' => {
                self.pos += 1;
                ValueKind::Int(self.number(b'e', true)?)
            }
            b'0'..=b'9' => {
                let len = self.number(b':', false)? as usize;
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|&end| end <= self.data.len())
                    .ok_or_else(|| error_at("byte string runs past the end", start))?;
                let bytes = self.data[self.pos..end].to_vec();
                self.pos = end;
                ValueKind::Bytes(bytes)
            }
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                ValueKind::List(list)
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key_pos = self.pos;
                    let key = match self.value(depth + 1)?.kind {
                        ValueKind::Bytes(key) => key,
                        _ => return Err(error_at("dictionary key is not a byte string", key_pos)),
                    };
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                ValueKind::Dict(dict)
            }
            _ => return Err(error_at("unknown value type", start)),
        };
        Ok(Value {
            kind,
            span: start..self.pos,
        })
    }
}

/// Decode exactly one value spanning all of `data`
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(error_at("trailing data after value", decoder.pos));
    }
    Ok(value)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match &value.kind {
        ValueKind::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        ValueKind::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        ValueKind::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        ValueKind::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Encode with dictionary keys in sorted order
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
        assert_eq!(decode(b"i-7e").unwrap().as_int(), Some(-7));
        assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
        assert_eq!(decode(b"4:spam").unwrap().as_bytes(), Some(&b"spam"[..]));
        assert_eq!(decode(b"0:").unwrap().as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for bad in [
            &b"i03e"[..],
            b"i-0e",
            b"ie",
            b"i12",
            b"5:spam",
            b"l4:spam",
            b"d3:fooe",
            b"di1e3:fooe",
            b"i1ei2e",
            b"x",
            b"",
        ] {
            assert!(decode(bad).is_err(), "{:?} should be rejected", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let mut data = vec![b'l'; 100];
        data.extend(vec![b'e'; 100]);
        assert!(decode(&data).is_err());

        let mut data = vec![b'l'; 10];
        data.extend(vec![b'e'; 10]);
        assert!(decode(&data).is_ok());
    }

    #[test]
    fn test_spans_point_at_source_bytes() {
        let data = b"d8:announce3:url4:infod4:name1:xee";
        let root = decode(data).unwrap();
        assert_eq!(root.span, 0..data.len());
        let info = root.get("info").unwrap();
        assert_eq!(&data[info.span.clone()], b"d4:name1:xe");
        assert_eq!(info.get("name").unwrap().as_string().as_deref(), Some("x"));
    }

    #[test]
    fn test_encode_sorts_keys() {
        let value = Value::dict_from([
            ("zeta", Value::int(1)),
            ("alpha", Value::list(vec![Value::bytes("a"), Value::int(-3)])),
        ]);
        assert_eq!(encode(&value), b"d5:alphal1:ai-3ee4:zetai1ee".to_vec());
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }
}
