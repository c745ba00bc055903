// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Program arguments for the main task.
//!
//! The arguments are packed into a single data block:
//!
//! ```text
//! +-------+-----------+-----+-------------+---------+-----+
//! | count | offset[0] | ... | offset[n-1] | arg0 \0 | ... |
//! +-------+-----------+-----+-------------+---------+-----+
//! ```
//!
//! All integers are little-endian `u64`s, offsets are relative to the start of the block.

use crate::context::RuntimeContext;
use crate::error::Result;
use crate::guid::Guid;
use core::fmt;

const WORD: usize = size_of::<u64>();

/// Packs `args` into a fresh data block and returns its handle.
///
/// # Errors
///
/// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the data block cannot be
/// allocated.
pub fn pack<I, S>(ctx: &RuntimeContext<'_>, args: I) -> Result<Guid>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<S> = args.into_iter().collect();
    let header = WORD * (args.len() + 1);
    let len = header
        + args
            .iter()
            .map(|arg| arg.as_ref().len() + 1)
            .sum::<usize>();

    let guid = ctx.create_datablock(len)?;
    let db = ctx.datablock(guid)?;
    let mut bytes = db.write();

    bytes[..WORD].copy_from_slice(&(args.len() as u64).to_le_bytes());
    let mut offset = header;
    for (i, arg) in args.iter().enumerate() {
        let arg = arg.as_ref().as_bytes();
        let slot = WORD * (i + 1);
        bytes[slot..slot + WORD].copy_from_slice(&(offset as u64).to_le_bytes());
        bytes[offset..offset + arg.len()].copy_from_slice(arg);
        // the block is zeroed, so the terminator is already in place
        offset += arg.len() + 1;
    }

    tracing::trace!(?guid, argc = args.len(), len, "packed program arguments");
    Ok(guid)
}

/// A view of program arguments packed by [`pack`].
#[derive(Clone, Copy)]
pub struct ProgramArgs<'a> {
    bytes: &'a [u8],
    count: usize,
}

impl<'a> ProgramArgs<'a> {
    /// Interprets `bytes` as packed arguments. Returns `None` if the header is truncated.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let count = usize::try_from(read_word(bytes, 0)?).ok()?;
        let header = count.checked_add(1)?.checked_mul(WORD)?;
        if bytes.len() < header {
            return None;
        }
        Some(Self { bytes, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns argument `index`, `None` if it is out of range or not valid UTF-8.
    pub fn get(&self, index: usize) -> Option<&'a str> {
        if index >= self.count {
            return None;
        }
        let start = usize::try_from(read_word(self.bytes, WORD * (index + 1))?).ok()?;
        let rest = self.bytes.get(start..)?;
        let end = rest.iter().position(|b| *b == 0)?;
        core::str::from_utf8(&rest[..end]).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a str>> + '_ {
        (0..self.count).map(|i| self.get(i))
    }
}

impl fmt::Debug for ProgramArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

fn read_word(bytes: &[u8], at: usize) -> Option<u64> {
    let word = bytes.get(at..at.checked_add(WORD)?)?;
    Some(u64::from_le_bytes(word.try_into().ok()?))
}
