use super::{BencodeError, BencodeResult, Node, Value};
use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single top-level Bencode value from `bytes`.
///
/// Fails with [`BencodeError::TrailingBytes`] if anything is left over after
/// the value, since every caller of this entry point (torrent file parsing,
/// tracker response parsing, tests) expects `bytes` to hold exactly one
/// document.
#[instrument(skip(bytes), level = "debug")]
pub fn decode(bytes: &[u8]) -> BencodeResult<Node> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let node = cursor.decode_node()?;
    if cursor.pos != bytes.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(node)
}

/// Decodes a single Bencode value from the front of `bytes`, returning the
/// node and the number of bytes it consumed. Unlike [`decode`], trailing
/// bytes are not an error — this is how lists and dictionaries peel off
/// their elements one at a time.
#[instrument(skip(bytes), level = "trace")]
pub fn decode_prefix(bytes: &[u8]) -> BencodeResult<(Node, usize)> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let node = cursor.decode_node()?;
    let consumed = cursor.pos;
    Ok((node, consumed))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn take(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, b: u8) -> BencodeResult<()> {
        let got = self.take()?;
        if got != b {
            return Err(BencodeError::UnexpectedByte(got, self.pos - 1));
        }
        Ok(())
    }

    fn decode_node(&mut self) -> BencodeResult<Node> {
        let start = self.pos;
        let value = match self.peek()? {
            b'i' => self.decode_integer()?,
            b'0'..=b'9' => self.decode_string()?,
            b'l' => self.decode_list()?,
            b'd' => self.decode_dict()?,
            other => return Err(BencodeError::UnexpectedByte(other, self.pos)),
        };
        Ok(Node::new(value, start..self.pos))
    }

    /// `i<signed-decimal>e`. No leading zeros except the literal `0`; `-0` is
    /// rejected outright.
    fn decode_integer(&mut self) -> BencodeResult<Value> {
        let start = self.pos;
        self.expect(b'i')?;
        let digits_start = self.pos;
        loop {
            match self.peek()? {
                b'e' => break,
                _ => {
                    self.pos += 1;
                }
            }
        }
        let digits = &self.bytes[digits_start..self.pos];
        self.expect(b'e')?;

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidNumber(start))?;
        validate_integer_text(text).ok_or(BencodeError::InvalidNumber(start))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidNumber(start))?;
        Ok(Value::Int(value))
    }

    /// `<non-negative-decimal>:<N bytes>`.
    fn decode_string(&mut self) -> BencodeResult<Value> {
        let start = self.pos;
        let len_start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len_text = std::str::from_utf8(&self.bytes[len_start..self.pos])
            .map_err(|_| BencodeError::InvalidNumber(start))?;
        if len_text.len() > 1 && len_text.starts_with('0') {
            return Err(BencodeError::InvalidNumber(start));
        }
        let len: usize = len_text
            .parse()
            .map_err(|_| BencodeError::InvalidNumber(start))?;
        self.expect(b':')?;

        let end = self
            .pos
            .checked_add(len)
            .ok_or(BencodeError::InvalidNumber(start))?;
        if end > self.bytes.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let s = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(Value::Str(s))
    }

    fn decode_list(&mut self) -> BencodeResult<Value> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                break;
            }
            items.push(self.decode_node()?);
        }
        Ok(Value::List(items))
    }

    fn decode_dict(&mut self) -> BencodeResult<Value> {
        self.expect(b'd')?;
        let mut map = BTreeMap::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                break;
            }
            let key = match self.decode_string()? {
                Value::Str(s) => s,
                _ => unreachable!("decode_string always returns Value::Str"),
            };
            let value = self.decode_node()?;
            map.insert(key, value);
        }
        Ok(Value::Dict(map))
    }
}

/// Rejects `""`, leading zeros other than the literal `"0"`, and `"-0"`.
fn validate_integer_text(text: &str) -> Option<()> {
    if text.is_empty() {
        return None;
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if text == "-0" {
        return None;
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_leading_zero() {
        assert!(decode(b"i03e").is_err());
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn accepts_literal_zero() {
        assert_eq!(decode(b"i0e").unwrap().value, Value::Int(0));
    }

    #[test]
    fn truncated_string_is_eof() {
        assert!(matches!(decode(b"5:hi"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert!(matches!(
            decode(b"i1ei2e"),
            Err(BencodeError::TrailingBytes)
        ));
    }
}
