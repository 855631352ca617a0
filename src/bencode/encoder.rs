use super::{BencodeResult, Node, Value};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

/// Encodes a [`Value`] into its canonical Bencode byte representation.
///
/// Dictionary keys are always emitted in ascending bytewise order (the
/// `BTreeMap` backing [`Value::Dict`] already holds them that way), so
/// `encode(decode(s))` reproduces `s` for any canonical input and reproduces
/// the canonical form for any non-canonical one.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value).expect("writing to a Vec<u8> never fails");
    out
}

/// Writes a [`Value`] to `writer`, returning the number of bytes written.
#[instrument(skip(writer, value), level = "trace")]
pub fn encode_to<W: Write>(writer: &mut W, value: &Value) -> BencodeResult<usize> {
    let mut counting = CountingWriter { inner: writer, count: 0 };
    write_value(&mut counting, value)?;
    Ok(counting.count)
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    count: usize,
}

impl<'a, W: Write> Write for CountingWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_value<W: Write>(writer: &mut W, value: &Value) -> BencodeResult<()> {
    match value {
        Value::Int(i) => write_integer(writer, *i),
        Value::Str(s) => write_string(writer, s),
        Value::List(items) => write_list(writer, items),
        Value::Dict(dict) => write_dict(writer, dict),
    }
}

fn write_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn write_list<W: Write>(writer: &mut W, items: &[Node]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in items {
        write_value(writer, &item.value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// `BTreeMap` already iterates keys in ascending order, so this never needs
/// to sort before emitting — unlike a `HashMap`-backed dictionary, whose
/// iteration order is unspecified and would silently corrupt the info-hash.
fn write_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, Node>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        write_string(writer, key)?;
        write_value(writer, &value.value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::decoder::decode;
    use super::*;

    #[test]
    fn encode_is_inverse_of_decode_for_canonical_input() {
        let source: &[u8] = b"d3:agei29e4:name6:archere";
        let node = decode(source).unwrap();
        assert_eq!(encode(&node.value), source);
    }

    #[test]
    fn non_canonical_dict_round_trips_to_canonical_form() {
        let source: &[u8] = b"d4:name6:archer3:agei29ee";
        let node = decode(source).unwrap();
        assert_eq!(encode(&node.value), b"d3:agei29e4:name6:archere");
    }
}
