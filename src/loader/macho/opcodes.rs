//! Rebase and bind opcode streams.
//!
//! Both streams are small byte-code programs over a running
//! `(segment, offset)` cursor. Decoding and interpretation are split: a
//! decoder turns bytes into [`RebaseOp`]/[`BindOp`], and a pure step
//! function turns `(state, op)` into the next state plus the runs of
//! pointer-sized slots to patch. Applying the runs to memory is left to the
//! caller.

use super::MachError;
use crate::Result;
use crate::reader::ByteReader;

const OPCODE_MASK: u8 = 0xf0;
const IMMEDIATE_MASK: u8 = 0x0f;

const POINTER_SIZE: u64 = 8;

pub(crate) const REBASE_TYPE_POINTER: u8 = 1;
pub(crate) const BIND_TYPE_POINTER: u8 = 1;
pub(crate) const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;

const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;

/// Segment index and offset into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Location {
    pub segment: u8,
    pub offset: u64,
}

fn advance(location: Option<Location>, delta: u64) -> Option<Location> {
    location.map(|l| Location {
        segment: l.segment,
        offset: l.offset.wrapping_add(delta),
    })
}

/// `count` slots starting at `start`, `stride` bytes apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Run {
    pub start: Option<Location>,
    pub count: u64,
    pub stride: u64,
}

impl Run {
    fn new(start: Option<Location>, count: u64, stride: u64) -> Self {
        Self {
            start,
            count,
            stride,
        }
    }

    /// Location of each slot. A run without a location yields `None` once
    /// per slot so the caller can report it.
    pub fn slots(&self) -> impl Iterator<Item = Option<Location>> + '_ {
        (0..self.count).map(|i| advance(self.start, i.wrapping_mul(self.stride)))
    }
}

/// Reads operands following an opcode byte.
struct Cursor<'r, 'a> {
    stream: &'r ByteReader<'a>,
    offset: u64,
}

impl<'a> Cursor<'_, 'a> {
    fn uleb(&mut self) -> Result<u64> {
        let (value, len) = self.stream.uleb128(self.offset)?;
        self.offset += len;
        Ok(value)
    }

    fn sleb(&mut self) -> Result<i64> {
        let (value, len) = self.stream.sleb128(self.offset)?;
        self.offset += len;
        Ok(value)
    }

    fn cstr(&mut self) -> Result<&'a str> {
        let s = self.stream.cstr(self.offset)?;
        self.offset += s.len() as u64 + 1;
        Ok(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RebaseOp {
    Done,
    SetType(u8),
    SetSegmentAndOffset { segment: u8, offset: u64 },
    AddAddr(u64),
    DoRebaseTimes(u64),
    DoRebaseAddAddr(u64),
    DoRebaseTimesSkipping { count: u64, skip: u64 },
}

/// Decode the rebase opcode at `offset`; returns it and the next offset.
pub(crate) fn decode_rebase(stream: &ByteReader<'_>, offset: u64) -> Result<(RebaseOp, u64)> {
    let byte = stream.u8(offset)?;
    let imm = byte & IMMEDIATE_MASK;
    let mut c = Cursor {
        stream,
        offset: offset + 1,
    };
    let op = match byte & OPCODE_MASK {
        REBASE_OPCODE_DONE => RebaseOp::Done,
        REBASE_OPCODE_SET_TYPE_IMM => RebaseOp::SetType(imm),
        REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => RebaseOp::SetSegmentAndOffset {
            segment: imm,
            offset: c.uleb()?,
        },
        REBASE_OPCODE_ADD_ADDR_ULEB => RebaseOp::AddAddr(c.uleb()?),
        REBASE_OPCODE_ADD_ADDR_IMM_SCALED => RebaseOp::AddAddr(u64::from(imm) * POINTER_SIZE),
        REBASE_OPCODE_DO_REBASE_IMM_TIMES => RebaseOp::DoRebaseTimes(u64::from(imm)),
        REBASE_OPCODE_DO_REBASE_ULEB_TIMES => RebaseOp::DoRebaseTimes(c.uleb()?),
        REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => RebaseOp::DoRebaseAddAddr(c.uleb()?),
        REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
            let count = c.uleb()?;
            let skip = c.uleb()?;
            RebaseOp::DoRebaseTimesSkipping { count, skip }
        }
        _ => return Err(MachError::UnknownRebaseOpcode(byte).into()),
    };
    Ok((op, c.offset))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RebaseState {
    pub kind: u8,
    pub location: Option<Location>,
}

impl Default for RebaseState {
    fn default() -> Self {
        Self {
            kind: REBASE_TYPE_POINTER,
            location: None,
        }
    }
}

/// Interpret one rebase opcode. `Done` is the caller's stop condition and
/// leaves the state unchanged.
pub(crate) fn rebase_step(state: RebaseState, op: RebaseOp) -> (RebaseState, Option<Run>) {
    let mut next = state;
    let run = match op {
        RebaseOp::Done => None,
        RebaseOp::SetType(kind) => {
            next.kind = kind;
            None
        }
        RebaseOp::SetSegmentAndOffset { segment, offset } => {
            next.location = Some(Location { segment, offset });
            None
        }
        RebaseOp::AddAddr(delta) => {
            next.location = advance(state.location, delta);
            None
        }
        RebaseOp::DoRebaseTimes(count) => {
            next.location = advance(state.location, count.wrapping_mul(POINTER_SIZE));
            Some(Run::new(state.location, count, POINTER_SIZE))
        }
        RebaseOp::DoRebaseAddAddr(delta) => {
            next.location = advance(state.location, delta.wrapping_add(POINTER_SIZE));
            Some(Run::new(state.location, 1, POINTER_SIZE))
        }
        RebaseOp::DoRebaseTimesSkipping { count, skip } => {
            let stride = skip.wrapping_add(POINTER_SIZE);
            next.location = advance(state.location, count.wrapping_mul(stride));
            Some(Run::new(state.location, count, stride))
        }
    };
    (next, run)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BindOp<'a> {
    Done,
    SetOrdinal(i64),
    SetSymbol { name: &'a str, flags: u8 },
    SetType(u8),
    SetAddend(i64),
    SetSegmentAndOffset { segment: u8, offset: u64 },
    AddAddr(u64),
    DoBindTimesSkipping { count: u64, skip: u64 },
}

/// Decode the bind opcode at `offset`; returns it and the next offset.
///
/// The `DO_BIND` variants are normalized: a single bind followed by an
/// address increment is a one-element skipping run.
pub(crate) fn decode_bind<'a>(stream: &ByteReader<'a>, offset: u64) -> Result<(BindOp<'a>, u64)> {
    let byte = stream.u8(offset)?;
    let imm = byte & IMMEDIATE_MASK;
    let mut c = Cursor {
        stream,
        offset: offset + 1,
    };
    let op = match byte & OPCODE_MASK {
        BIND_OPCODE_DONE => BindOp::Done,
        BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => BindOp::SetOrdinal(i64::from(imm)),
        BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => BindOp::SetOrdinal(c.uleb()? as i64),
        BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
            let ordinal = if imm == 0 {
                0
            } else {
                i64::from((imm | OPCODE_MASK) as i8)
            };
            BindOp::SetOrdinal(ordinal)
        }
        BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => BindOp::SetSymbol {
            name: c.cstr()?,
            flags: imm,
        },
        BIND_OPCODE_SET_TYPE_IMM => BindOp::SetType(imm),
        BIND_OPCODE_SET_ADDEND_SLEB => BindOp::SetAddend(c.sleb()?),
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => BindOp::SetSegmentAndOffset {
            segment: imm,
            offset: c.uleb()?,
        },
        BIND_OPCODE_ADD_ADDR_ULEB => BindOp::AddAddr(c.uleb()?),
        BIND_OPCODE_DO_BIND => BindOp::DoBindTimesSkipping { count: 1, skip: 0 },
        BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => BindOp::DoBindTimesSkipping {
            count: 1,
            skip: c.uleb()?,
        },
        BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => BindOp::DoBindTimesSkipping {
            count: 1,
            skip: u64::from(imm) * POINTER_SIZE,
        },
        BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
            let count = c.uleb()?;
            let skip = c.uleb()?;
            BindOp::DoBindTimesSkipping { count, skip }
        }
        _ => return Err(MachError::UnknownBindOpcode(byte).into()),
    };
    Ok((op, c.offset))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BindState<'a> {
    pub kind: u8,
    pub ordinal: i64,
    pub flags: u8,
    pub addend: i64,
    pub symbol: Option<&'a str>,
    pub location: Option<Location>,
}

impl Default for BindState<'_> {
    fn default() -> Self {
        Self {
            kind: BIND_TYPE_POINTER,
            ordinal: 0,
            flags: 0,
            addend: 0,
            symbol: None,
            location: None,
        }
    }
}

/// Interpret one bind opcode. Binds are reported as a run plus the state
/// they were made with.
pub(crate) fn bind_step<'a>(
    state: BindState<'a>,
    op: BindOp<'a>,
) -> (BindState<'a>, Option<(BindState<'a>, Run)>) {
    let mut next = state;
    match op {
        BindOp::Done => {}
        BindOp::SetOrdinal(ordinal) => next.ordinal = ordinal,
        BindOp::SetSymbol { name, flags } => {
            next.symbol = Some(name);
            next.flags = flags;
        }
        BindOp::SetType(kind) => next.kind = kind,
        BindOp::SetAddend(addend) => next.addend = addend,
        BindOp::SetSegmentAndOffset { segment, offset } => {
            next.location = Some(Location { segment, offset });
        }
        BindOp::AddAddr(delta) => next.location = advance(state.location, delta),
        BindOp::DoBindTimesSkipping { count, skip } => {
            let stride = skip.wrapping_add(POINTER_SIZE);
            next.location = advance(state.location, count.wrapping_mul(stride));
            return (next, Some((state, Run::new(state.location, count, stride))));
        }
    }
    (next, None)
}
