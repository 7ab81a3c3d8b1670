//! Thrift Binary Protocol type tags and a reference skipper.
//!
//! The skipper runs on the host side; compiled decoders call into it for
//! unknown field ids and for known ids arriving with the wrong tag.

use crate::error::ErrorCode;
use crate::schema::Kind;

pub const STOP: u8 = 0;
pub const BOOL: u8 = 2;
pub const BYTE: u8 = 3;
pub const DOUBLE: u8 = 4;
pub const I16: u8 = 6;
pub const I32: u8 = 8;
pub const I64: u8 = 10;
pub const STRING: u8 = 11;
pub const STRUCT: u8 = 12;
pub const MAP: u8 = 13;
pub const SET: u8 = 14;
pub const LIST: u8 = 15;

/// The wire tag of a descriptor kind. Binary shares the string tag, pointers
/// share the struct tag.
pub fn tag_of(kind: Kind) -> u8 {
    match kind {
        Kind::Bool => BOOL,
        Kind::I8 => BYTE,
        Kind::I16 => I16,
        Kind::I32 => I32,
        Kind::I64 => I64,
        Kind::Double => DOUBLE,
        Kind::String | Kind::Binary => STRING,
        Kind::List => LIST,
        Kind::Set => SET,
        Kind::Map => MAP,
        Kind::Struct | Kind::Pointer => STRUCT,
    }
}

/// Fixed payload size of a scalar tag.
pub fn fixed_size(tag: u8) -> Option<usize> {
    match tag {
        BOOL | BYTE => Some(1),
        I16 => Some(2),
        I32 => Some(4),
        I64 | DOUBLE => Some(8),
        _ => None,
    }
}

/// Skips one value with wire tag `tag` starting at `buf[pos..]`.
///
/// Returns the position just past the value. `depth` bounds how many nested
/// structs/containers may be entered.
pub fn skip(buf: &[u8], pos: usize, tag: u8, depth: usize) -> Result<usize, (ErrorCode, usize)> {
    Skipper { buf, pos }.value(tag, depth)
}

struct Skipper<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Skipper<'_> {
    fn need(&self, n: usize) -> Result<(), (ErrorCode, usize)> {
        match self.pos.checked_add(n) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err((ErrorCode::UnexpectedEof, self.pos)),
        }
    }

    fn u8(&mut self) -> Result<u8, (ErrorCode, usize)> {
        self.need(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn len(&mut self) -> Result<usize, (ErrorCode, usize)> {
        self.need(4)?;
        let at = self.pos;
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.buf[at..at + 4]);
        self.pos += 4;
        let n = i32::from_be_bytes(be);
        if n < 0 {
            return Err((ErrorCode::InvalidLength, at));
        }
        Ok(n as usize)
    }

    fn value(mut self, tag: u8, depth: usize) -> Result<usize, (ErrorCode, usize)> {
        self.skip(tag, depth)?;
        Ok(self.pos)
    }

    fn skip(&mut self, tag: u8, depth: usize) -> Result<(), (ErrorCode, usize)> {
        if let Some(n) = fixed_size(tag) {
            self.need(n)?;
            self.pos += n;
            return Ok(());
        }
        match tag {
            STRING => {
                let n = self.len()?;
                self.need(n)?;
                self.pos += n;
            }
            STRUCT => {
                let depth = self.enter(depth)?;
                loop {
                    let t = self.u8()?;
                    if t == STOP {
                        break;
                    }
                    self.need(2)?;
                    self.pos += 2;
                    self.skip(t, depth)?;
                }
            }
            LIST | SET => {
                let depth = self.enter(depth)?;
                let elem = self.u8()?;
                let n = self.len()?;
                self.elements(&[elem], n, depth)?;
            }
            MAP => {
                let depth = self.enter(depth)?;
                let k = self.u8()?;
                let v = self.u8()?;
                let n = self.len()?;
                self.elements(&[k, v], n, depth)?;
            }
            _ => return Err((ErrorCode::InvalidTag, self.pos.saturating_sub(1))),
        }
        Ok(())
    }

    fn enter(&self, depth: usize) -> Result<usize, (ErrorCode, usize)> {
        depth
            .checked_sub(1)
            .ok_or((ErrorCode::NestingOverflow, self.pos))
    }

    fn elements(&mut self, tags: &[u8], n: usize, depth: usize) -> Result<(), (ErrorCode, usize)> {
        if n == 0 {
            return Ok(());
        }
        for &t in tags {
            if fixed_size(t).is_none() && !matches!(t, STRING | STRUCT | MAP | SET | LIST) {
                return Err((ErrorCode::InvalidTag, self.pos));
            }
        }
        // Fixed-size elements: one bounds check for the whole run.
        if let Some(per) = tags.iter().map(|&t| fixed_size(t)).sum::<Option<usize>>() {
            let total = per.checked_mul(n).ok_or((ErrorCode::UnexpectedEof, self.pos))?;
            self.need(total)?;
            self.pos += total;
            return Ok(());
        }
        for _ in 0..n {
            for &t in tags {
                self.skip(t, depth)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_nested_struct() {
        // { 1: i32 7, 2: list<string> ["ab"] } STOP
        let buf = [
            I32, 0, 1, 0, 0, 0, 7, //
            LIST, 0, 2, STRING, 0, 0, 0, 1, 0, 0, 0, 2, b'a', b'b', //
            STOP, 0xff,
        ];
        assert_eq!(skip(&buf, 0, STRUCT, 8), Ok(buf.len() - 1));
    }

    #[test]
    fn rejects_negative_length_and_bad_tag() {
        let buf = [0xff, 0xff, 0xff, 0xff];
        assert_eq!(skip(&buf, 0, STRING, 8), Err((ErrorCode::InvalidLength, 0)));
        assert!(matches!(skip(&buf, 0, 1, 8), Err((ErrorCode::InvalidTag, _))));
    }

    #[test]
    fn depth_is_bounded() {
        // list<list<list<i8>>> with a single element at each level
        let buf = [LIST, 0, 0, 0, 1, LIST, 0, 0, 0, 1, BYTE, 0, 0, 0, 1, 5];
        assert_eq!(skip(&buf, 0, LIST, 3), Ok(buf.len()));
        assert_eq!(
            skip(&buf, 0, LIST, 2).map_err(|e| e.0),
            Err(ErrorCode::NestingOverflow)
        );
    }

    #[test]
    fn truncated_fixed_run_is_eof() {
        let buf = [I64, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(skip(&buf, 0, LIST, 4), Err((ErrorCode::UnexpectedEof, _))));
    }
}
