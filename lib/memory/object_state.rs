//! The byte contents of a `MemoryObject`.
//!
//! Every byte of an `ObjectState` is in exactly one of three states:
//!
//! * `Byte::Concrete` - a known value.
//! * `Byte::Symbolic` - a known expression.
//! * `Byte::Flushed` - the value is whatever the `UpdateList` says it is.
//!
//! Concrete values live in a flat byte store. Only the bytes which differ from
//! the object's default state are tracked individually, so a large, untouched
//! allocation costs its byte store and nothing more.
//!
//! Accesses at constant offsets work directly on the bytes. Accesses at
//! symbolic offsets go through the update list: a symbolic write flushes every
//! byte of the object into the list and then records itself, while a symbolic
//! read selects over the list and the bytes not yet flushed. Selects are
//! balanced trees over offsets, so their depth grows with the logarithm of the
//! object size. A constant-offset write over a flushed byte makes it concrete
//! again.

use crate::executor::eval;
use crate::il;
use crate::memory::Endian;
use crate::{Error, POINTER_BITS};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flushing more bytes than this at once is worth a warning.
const LARGE_FLUSH: u64 = 4096;

/// The value every byte takes under `initialize_to_random`.
const RANDOM_BYTE: u8 = 0xab;

/// One byte of an `ObjectState`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Byte {
    Concrete(u8),
    Symbolic(il::Expression),
    Flushed,
}

/// Bytes at consecutive offsets which share one value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Run {
    offset: u64,
    len: u64,
    value: il::Expression,
}

impl Run {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn value(&self) -> &il::Expression {
        &self.value
    }

    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Append `len` bytes of `value` at `offset` to `runs`, which are ascending
/// by offset, extending the last run when it holds the same constant.
fn push_run(runs: &mut Vec<Run>, offset: u64, len: u64, value: il::Expression) {
    if let Some(last) = runs.last_mut() {
        if last.end() == offset && value.get_constant().is_some() && last.value == value {
            last.len += len;
            return;
        }
    }
    runs.push(Run { offset, len, value });
}

/// The run of `runs` holding the constant `offset`.
fn find_run(runs: &[Run], offset: u64) -> Option<&Run> {
    let next = runs.partition_point(|run| run.offset <= offset);
    runs[..next].last().filter(|run| offset < run.end())
}

/// Select the value of the run holding `index`, which must lie in one of
/// `runs`.
fn select(runs: &[Run], index: &il::Expression) -> Result<il::Expression, Error> {
    match runs.len() {
        0 => Err(Error::Custom("select over no bytes".to_string())),
        1 => Ok(runs[0].value.clone()),
        n => {
            let mid = n / 2;
            let low = select(&runs[..mid], index)?;
            let high = select(&runs[mid..], index)?;
            if low == high {
                return Ok(low);
            }
            il::Expression::ite(
                il::Expression::cmpltu(
                    index.clone(),
                    il::expr_const(runs[mid].offset, POINTER_BITS),
                )?,
                low,
                high,
            )
        }
    }
}

/// `index` lies in one of `extents`, given as ascending `[begin, end)` pairs.
fn covers(extents: &[(u64, u64)], index: &il::Expression) -> Result<il::Expression, Error> {
    match extents.len() {
        0 => Ok(il::expr_false()),
        1 => {
            let (begin, end) = extents[0];
            if end - begin == 1 {
                il::Expression::cmpeq(index.clone(), il::expr_const(begin, POINTER_BITS))
            } else {
                il::Expression::cmpltu(
                    il::Expression::sub(index.clone(), il::expr_const(begin, POINTER_BITS))?,
                    il::expr_const(end - begin, POINTER_BITS),
                )
            }
        }
        n => il::Expression::or(
            covers(&extents[..n / 2], index)?,
            covers(&extents[n / 2..], index)?,
        ),
    }
}

/// The value at `index` after writing `runs` over `under`, in an object of
/// `size` bytes.
fn layer_read<F>(
    runs: &[Run],
    index: &il::Expression,
    size: u64,
    under: F,
) -> Result<il::Expression, Error>
where
    F: FnOnce() -> Result<il::Expression, Error>,
{
    if let Some(constant) = index.get_constant() {
        return match find_run(runs, constant.value()) {
            Some(run) => Ok(run.value.clone()),
            None => under(),
        };
    }
    if runs.is_empty() {
        return under();
    }

    let mut extents: Vec<(u64, u64)> = Vec::new();
    for run in runs {
        match extents.last_mut() {
            Some(last) if last.1 == run.offset => last.1 = run.end(),
            _ => extents.push((run.offset, run.end())),
        }
    }
    let value = select(runs, index)?;
    // in-bounds reads of a layer over the whole object never reach `under`
    if extents == [(0, size)] {
        return Ok(value);
    }
    il::Expression::ite(covers(&extents, index)?, value, under()?)
}

/// One entry of an `UpdateList`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Update {
    /// An 8-bit write at a possibly symbolic index.
    Write(il::Expression, il::Expression),
    /// Bytes flushed from constant offsets, ascending by offset.
    Layer(Vec<Run>),
}

/// An ordered log of writes at (possibly) symbolic offsets, over a root array.
///
/// The root is either all zeroes, or a named symbolic array whose byte `i` is
/// the 8-bit scalar `name[i]`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdateList {
    root: Option<String>,
    size: u64,
    updates: Vec<Update>,
}

impl UpdateList {
    pub fn new(root: Option<String>, size: u64) -> UpdateList {
        UpdateList {
            root,
            size,
            updates: Vec::new(),
        }
    }

    /// The name of the symbolic root array, if there is one.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// The entries of this list, oldest first.
    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Record a write of the 8-bit `value` at `index`.
    pub fn extend(&mut self, index: il::Expression, value: il::Expression) {
        self.updates.push(Update::Write(index, value));
    }

    fn extend_layer(&mut self, runs: Vec<Run>) {
        if !runs.is_empty() {
            self.updates.push(Update::Layer(runs));
        }
    }

    fn root_byte(&self, index: u64) -> il::Expression {
        match self.root {
            Some(ref name) => il::expr_scalar(format!("{}[{}]", name, index), 8),
            None => il::expr_const(0, 8),
        }
    }

    /// The root byte at `index`, over the offsets `[low, high)`.
    fn root_select(
        &self,
        index: &il::Expression,
        low: u64,
        high: u64,
    ) -> Result<il::Expression, Error> {
        if high - low <= 1 {
            return Ok(self.root_byte(low));
        }
        let mid = low + (high - low) / 2;
        il::Expression::ite(
            il::Expression::cmpltu(index.clone(), il::expr_const(mid, POINTER_BITS))?,
            self.root_select(index, low, mid)?,
            self.root_select(index, mid, high)?,
        )
    }

    fn root_read(&self, index: &il::Expression) -> Result<il::Expression, Error> {
        if let Some(index) = index.get_constant() {
            return Ok(self.root_byte(index.value()));
        }
        if self.root.is_none() || self.size == 0 {
            return Ok(il::expr_const(0, 8));
        }
        self.root_select(index, 0, self.size)
    }

    /// The 8-bit value at `index` after every write in this list.
    pub fn read(&self, index: &il::Expression) -> Result<il::Expression, Error> {
        if let Some(constant) = index.get_constant() {
            // The newest write covering this exact offset wins, as long as no
            // write at a symbolic offset came after it.
            let offset = constant.value();
            let mut shadowed = false;
            for update in self.updates.iter().rev() {
                match *update {
                    Update::Write(ref update_index, ref value) => {
                        match update_index.get_constant() {
                            Some(c) if c == constant => return Ok(value.clone()),
                            Some(_) => continue,
                            None => {
                                shadowed = true;
                                break;
                            }
                        }
                    }
                    Update::Layer(ref runs) => {
                        if let Some(run) = find_run(runs, offset) {
                            return Ok(run.value.clone());
                        }
                    }
                }
            }
            if !shadowed {
                return Ok(self.root_byte(offset));
            }
        }

        let mut value = self.root_read(index)?;
        for update in &self.updates {
            value = match *update {
                Update::Write(ref update_index, ref update_value) => il::Expression::ite(
                    il::Expression::cmpeq(index.clone(), update_index.clone())?,
                    update_value.clone(),
                    value,
                )?,
                Update::Layer(ref runs) => layer_read(runs, index, self.size, move || Ok(value))?,
            };
        }
        eval::simplify(&value)
    }
}

/// How a byte differs from the default state of its object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
enum Tag {
    Concrete,
    Symbolic(il::Expression),
    Flushed,
}

/// The contents of one `MemoryObject`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjectState {
    concrete: Vec<u8>,
    /// Bytes whose state is not the default, by offset.
    overlay: BTreeMap<u64, Tag>,
    /// Untracked bytes are flushed rather than concrete.
    flushed_by_default: bool,
    updates: UpdateList,
    read_only: bool,
    endian: Endian,
}

impl ObjectState {
    /// Create a new, concrete `ObjectState` of `size` bytes. The initial
    /// contents are undefined, and happen to be zero.
    pub fn new(size: u64, endian: Endian) -> ObjectState {
        ObjectState {
            concrete: vec![0; size as usize],
            overlay: BTreeMap::new(),
            flushed_by_default: false,
            updates: UpdateList::new(None, size),
            read_only: false,
            endian,
        }
    }

    /// Create a new `ObjectState` of `size` bytes, every byte of which is
    /// drawn from the symbolic array `name`.
    pub fn new_symbolic<S: Into<String>>(size: u64, name: S, endian: Endian) -> ObjectState {
        ObjectState {
            concrete: vec![0; size as usize],
            overlay: BTreeMap::new(),
            flushed_by_default: true,
            updates: UpdateList::new(Some(name.into()), size),
            read_only: false,
            endian,
        }
    }

    /// Set every byte to zero.
    pub fn initialize_to_zero(&mut self) {
        self.initialize_to(0);
    }

    /// Set every byte to an arbitrary, but deterministic, value.
    pub fn initialize_to_random(&mut self) {
        self.initialize_to(RANDOM_BYTE);
    }

    fn initialize_to(&mut self, byte: u8) {
        self.concrete.iter_mut().for_each(|b| *b = byte);
        self.overlay.clear();
        self.flushed_by_default = false;
        self.updates = UpdateList::new(None, self.size());
    }

    pub fn size(&self) -> u64 {
        self.concrete.len() as u64
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// The state of the byte at `offset`.
    pub fn byte(&self, offset: u64) -> Option<Byte> {
        let value = *self.concrete.get(offset as usize)?;
        Some(match self.overlay.get(&offset) {
            Some(Tag::Concrete) => Byte::Concrete(value),
            Some(Tag::Symbolic(expr)) => Byte::Symbolic(expr.clone()),
            Some(Tag::Flushed) => Byte::Flushed,
            None if self.flushed_by_default => Byte::Flushed,
            None => Byte::Concrete(value),
        })
    }

    pub fn updates(&self) -> &UpdateList {
        &self.updates
    }

    /// Returns true if every byte of this object holds a concrete value.
    pub fn is_concrete(&self) -> bool {
        self.num_concrete() as u64 == self.size()
    }

    /// The number of bytes holding a concrete value.
    pub fn num_concrete(&self) -> usize {
        let tagged = self
            .overlay
            .values()
            .filter(|tag| **tag == Tag::Concrete)
            .count();
        if self.flushed_by_default {
            tagged
        } else {
            self.concrete.len() - (self.overlay.len() - tagged)
        }
    }

    fn set_tag(&mut self, offset: u64, tag: Tag) {
        let default = if self.flushed_by_default {
            Tag::Flushed
        } else {
            Tag::Concrete
        };
        if tag == default {
            self.overlay.remove(&offset);
        } else {
            self.overlay.insert(offset, tag);
        }
    }

    fn byte_value(&self, offset: u64) -> Result<il::Expression, Error> {
        Ok(match self.byte(offset) {
            Some(Byte::Concrete(value)) => il::expr_const(u64::from(value), 8),
            Some(Byte::Symbolic(expr)) => expr,
            Some(Byte::Flushed) => self
                .updates
                .read(&il::expr_const(offset, POINTER_BITS))?,
            None => {
                return Err(Error::OutOfBounds {
                    offset,
                    bytes: 1,
                    size: self.size(),
                })
            }
        })
    }

    fn push_concrete(&self, runs: &mut Vec<Run>, begin: u64, end: u64) {
        let mut offset = begin;
        while offset < end {
            let value = self.concrete[offset as usize];
            let len = self.concrete[offset as usize..end as usize]
                .iter()
                .take_while(|byte| **byte == value)
                .count() as u64;
            push_run(runs, offset, len, il::expr_const(u64::from(value), 8));
            offset += len;
        }
    }

    /// Every byte not yet flushed, as runs ascending by offset.
    fn pending_runs(&self) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut cursor = 0;
        for (&offset, tag) in &self.overlay {
            if !self.flushed_by_default {
                self.push_concrete(&mut runs, cursor, offset);
            }
            match *tag {
                Tag::Concrete => self.push_concrete(&mut runs, offset, offset + 1),
                Tag::Symbolic(ref expr) => push_run(&mut runs, offset, 1, expr.clone()),
                Tag::Flushed => {}
            }
            cursor = offset + 1;
        }
        if !self.flushed_by_default {
            self.push_concrete(&mut runs, cursor, self.size());
        }
        runs
    }

    fn flush(&mut self) {
        let runs = self.pending_runs();
        let pending: u64 = runs.iter().map(Run::len).sum();
        if pending > LARGE_FLUSH {
            warn!("flushing {} bytes into an update list", pending);
        }
        self.updates.extend_layer(runs);
        self.overlay.clear();
        self.flushed_by_default = true;
    }

    fn read8_symbolic(&self, offset: &il::Expression) -> Result<il::Expression, Error> {
        // Bytes not yet flushed were written after everything in the log, so
        // they are applied on top of it.
        let runs = self.pending_runs();
        let value = layer_read(&runs, offset, self.size(), || self.updates.read(offset))?;
        eval::simplify(&value)
    }

    fn check_bounds(&self, offset: u64, bytes: u64) -> Result<(), Error> {
        if bytes > self.size() || offset > self.size() - bytes {
            Err(Error::OutOfBounds {
                offset,
                bytes,
                size: self.size(),
            })
        } else {
            Ok(())
        }
    }

    /// Read `bits` bits at `offset`.
    ///
    /// The caller guarantees a symbolic `offset` is in bounds.
    pub fn read(&self, offset: &il::Expression, bits: usize) -> Result<il::Expression, Error> {
        if let Some(offset) = offset.get_constant() {
            return self.read_at(offset.value(), bits);
        }

        let bytes = width_to_bytes(bits)?;
        let mut values = Vec::with_capacity(bytes as usize);
        for i in 0..bytes {
            let index = eval::simplify(&il::Expression::add(
                offset.clone(),
                il::expr_const(i, POINTER_BITS),
            )?)?;
            values.push(self.read8_symbolic(&index)?);
        }
        assemble_value(values, bits, self.endian)
    }

    /// Read `bits` bits at the constant `offset`.
    pub fn read_at(&self, offset: u64, bits: usize) -> Result<il::Expression, Error> {
        let bytes = width_to_bytes(bits)?;
        self.check_bounds(offset, bytes)?;
        let values = (0..bytes)
            .map(|i| self.byte_value(offset + i))
            .collect::<Result<Vec<il::Expression>, Error>>()?;
        assemble_value(values, bits, self.endian)
    }

    /// Read `len` bytes at `offset`, if all of them are concrete.
    pub fn read_concrete(&self, offset: u64, len: u64) -> Result<Option<Vec<u8>>, Error> {
        self.check_bounds(offset, len)?;
        let mut buf = Vec::with_capacity(len as usize);
        for i in offset..offset + len {
            match eval::simplify(&self.byte_value(i)?)?.get_constant() {
                Some(c) => buf.push(c.value() as u8),
                None => return Ok(None),
            }
        }
        Ok(Some(buf))
    }

    /// Write `value` at `offset`.
    ///
    /// The caller guarantees a symbolic `offset` is in bounds.
    /// # Error
    /// The object is read-only. Nothing is written.
    pub fn write(&mut self, offset: &il::Expression, value: &il::Expression) -> Result<(), Error> {
        if let Some(offset) = offset.get_constant() {
            return self.write_at(offset.value(), value);
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let values = split_value(value, self.endian)?;
        self.flush();
        for (i, byte) in values.into_iter().enumerate() {
            let index = eval::simplify(&il::Expression::add(
                offset.clone(),
                il::expr_const(i as u64, POINTER_BITS),
            )?)?;
            self.updates.extend(index, byte);
        }
        Ok(())
    }

    /// Write `value` at the constant `offset`.
    pub fn write_at(&mut self, offset: u64, value: &il::Expression) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let values = split_value(value, self.endian)?;
        self.check_bounds(offset, values.len() as u64)?;
        for (i, byte) in values.into_iter().enumerate() {
            let at = offset + i as u64;
            match byte.get_constant() {
                Some(c) => {
                    self.concrete[at as usize] = c.value() as u8;
                    self.set_tag(at, Tag::Concrete);
                }
                None => self.set_tag(at, Tag::Symbolic(byte)),
            }
        }
        Ok(())
    }
}

/// The number of bytes an access of `bits` bits touches. Booleans occupy a
/// byte.
pub(crate) fn width_to_bytes(bits: usize) -> Result<u64, Error> {
    if bits == 1 {
        Ok(1)
    } else if bits == 0 || bits % 8 != 0 || bits > 64 {
        Err(Error::BadWidth(bits))
    } else {
        Ok((bits / 8) as u64)
    }
}

/// The significance of the byte at memory position `i` of `n`.
fn significance(endian: Endian, i: u64, n: u64) -> u64 {
    match endian {
        Endian::Little => i,
        Endian::Big => n - 1 - i,
    }
}

/// Split `value` into bytes, given in memory order.
pub(crate) fn split_value(
    value: &il::Expression,
    endian: Endian,
) -> Result<Vec<il::Expression>, Error> {
    let value = if value.bits() == 1 {
        il::Expression::zext(8, value.clone())?
    } else {
        value.clone()
    };
    let bytes = width_to_bytes(value.bits())?;
    (0..bytes)
        .map(|i| extract_byte(&value, significance(endian, i, bytes)))
        .collect()
}

/// Combine bytes, given in memory order, into a value of `bits` bits.
pub(crate) fn assemble_value(
    values: Vec<il::Expression>,
    bits: usize,
    endian: Endian,
) -> Result<il::Expression, Error> {
    if values.len() as u64 != width_to_bytes(bits)? {
        return Err(Error::BadWidth(bits));
    }
    if bits == 1 {
        return eval::simplify(&il::Expression::trun(1, values[0].clone())?);
    }

    let n = values.len() as u64;
    let mut by_significance: Vec<Option<il::Expression>> = vec![None; values.len()];
    for (i, value) in values.into_iter().enumerate() {
        by_significance[significance(endian, i as u64, n) as usize] = Some(value);
    }
    let by_significance = by_significance
        .into_iter()
        .collect::<Option<Vec<il::Expression>>>()
        .ok_or_else(|| Error::Custom("byte significance is not a permutation".to_string()))?;

    if let Some(whole) = coalesce(&by_significance, bits) {
        return Ok(whole);
    }

    let mut result: Option<il::Expression> = None;
    for (k, byte) in by_significance.into_iter().enumerate() {
        let part = il::Expression::shl(
            il::Expression::zext(bits, byte)?,
            il::expr_const(8 * k as u64, bits),
        )?;
        result = Some(match result {
            Some(result) => il::Expression::or(result, part)?,
            None => part,
        });
    }
    match result {
        Some(result) => eval::simplify(&result),
        None => Err(Error::BadWidth(bits)),
    }
}

/// Byte `k`, counting from the least significant, of `value`.
fn extract_byte(value: &il::Expression, k: u64) -> Result<il::Expression, Error> {
    if value.bits() == 8 {
        return Ok(value.clone());
    }
    eval::simplify(&il::Expression::trun(
        8,
        il::Expression::shr(value.clone(), il::expr_const(8 * k, value.bits()))?,
    )?)
}

/// If `bytes`, least significant first, are exactly the bytes of a single
/// value of `bits` bits, return that value.
fn coalesce(bytes: &[il::Expression], bits: usize) -> Option<il::Expression> {
    let mut whole: Option<&il::Expression> = None;
    for (k, byte) in bytes.iter().enumerate() {
        let (source, shift) = match *byte {
            il::Expression::Trun(8, ref inner) => match **inner {
                il::Expression::Shr(ref source, ref shift) => {
                    (source.as_ref(), shift.get_constant()?.value())
                }
                ref source => (source, 0),
            },
            ref source if bits == 8 => (source, 0),
            _ => return None,
        };
        if source.bits() != bits || shift != 8 * k as u64 {
            return None;
        }
        match whole {
            Some(whole) if whole != source => return None,
            _ => whole = Some(source),
        }
    }
    whole.cloned()
}

#[cfg(test)]
mod object_state_tests {
    use super::*;

    fn offset(scalar: &str) -> il::Expression {
        il::expr_scalar(scalar, POINTER_BITS)
    }

    #[test]
    fn concrete_round_trip() {
        let mut os = ObjectState::new(16, Endian::Little);
        os.write_at(4, &il::expr_const(0xdeadbeef, 32)).unwrap();
        assert_eq!(os.read_at(4, 32).unwrap(), il::expr_const(0xdeadbeef, 32));
        assert_eq!(os.read_at(4, 8).unwrap(), il::expr_const(0xef, 8));
        assert_eq!(os.read_at(6, 16).unwrap(), il::expr_const(0xdead, 16));
        assert!(os.is_concrete());
    }

    #[test]
    fn big_endian_layout() {
        let mut os = ObjectState::new(8, Endian::Big);
        os.write_at(0, &il::expr_const(0x11223344, 32)).unwrap();
        assert_eq!(os.read_at(0, 8).unwrap(), il::expr_const(0x11, 8));
        assert_eq!(os.read_at(0, 32).unwrap(), il::expr_const(0x11223344, 32));
    }

    #[test]
    fn symbolic_value_round_trip() {
        let mut os = ObjectState::new(16, Endian::Little);
        let value = il::expr_scalar("v", 32);
        os.write_at(8, &value).unwrap();
        assert_eq!(os.read_at(8, 32).unwrap(), value);
        assert_eq!(os.num_concrete(), 12);
    }

    #[test]
    fn symbolic_object_bytes() {
        let os = ObjectState::new_symbolic(4, "buf", Endian::Little);
        assert_eq!(os.read_at(2, 8).unwrap(), il::expr_scalar("buf[2]", 8));
        assert!(!os.is_concrete());
    }

    #[test]
    fn constant_write_reconcretizes() {
        let mut os = ObjectState::new_symbolic(4, "buf", Endian::Little);
        os.write_at(0, &il::expr_const(0x0102, 16)).unwrap();
        assert_eq!(os.num_concrete(), 2);
        assert_eq!(os.read_concrete(0, 2).unwrap(), Some(vec![0x02, 0x01]));
        assert_eq!(os.read_concrete(0, 3).unwrap(), None);
    }

    #[test]
    fn symbolic_offset_write_then_read() {
        let mut os = ObjectState::new(4, Endian::Little);
        os.write_at(0, &il::expr_const(0x44332211, 32)).unwrap();
        os.write(&offset("i"), &il::expr_const(0xff, 8)).unwrap();

        // every byte has been flushed into the update list
        assert_eq!(os.num_concrete(), 0);
        assert_eq!(os.updates().len(), 2);

        let byte = os.read_at(1, 8).unwrap();
        let at = |i: u64| {
            eval::eval_with(&byte, &|_| Some(il::const_(i, POINTER_BITS)))
                .unwrap()
                .value()
        };
        assert_eq!(at(1), 0xff);
        assert_eq!(at(2), 0x22);
    }

    #[test]
    fn symbolic_offset_read_sees_later_concrete_writes() {
        let mut os = ObjectState::new(4, Endian::Little);
        os.write(&offset("i"), &il::expr_const(0xff, 8)).unwrap();
        os.write_at(3, &il::expr_const(0x77, 8)).unwrap();

        let value = os.read(&offset("j"), 8).unwrap();
        let eval_at = |i: u64, j: u64| {
            eval::eval_with(&value, &|s| {
                Some(il::const_(if s.name() == "i" { i } else { j }, POINTER_BITS))
            })
            .unwrap()
            .value()
        };
        assert_eq!(eval_at(3, 3), 0x77);
        assert_eq!(eval_at(2, 2), 0xff);
        assert_eq!(eval_at(2, 1), 0x00);
    }

    #[test]
    fn symbolic_offset_read_in_a_page() {
        let os = ObjectState::new_symbolic(4096, "page", Endian::Little);
        let value = os.read(&offset("i"), 16).unwrap();
        let at = |i: u64| {
            eval::eval_with(&value, &|s| match s.name() {
                "i" => Some(il::const_(i, POINTER_BITS)),
                "page[4094]" => Some(il::const_(0x34, 8)),
                "page[4095]" => Some(il::const_(0x12, 8)),
                _ => None,
            })
            .unwrap()
            .value()
        };
        assert_eq!(at(4094), 0x1234);

        let mut os = ObjectState::new(4096, Endian::Little);
        for i in 0..4096u64 {
            os.write_at(i, &il::expr_const(i & 0xff, 8)).unwrap();
        }
        let value = os.read(&offset("i"), 8).unwrap();
        let at = |i: u64| {
            eval::eval_with(&value, &|_| Some(il::const_(i, POINTER_BITS)))
                .unwrap()
                .value()
        };
        assert_eq!(at(0x123), 0x23);
        assert_eq!(at(0xfff), 0xff);
    }

    #[test]
    fn flush_records_runs() {
        let mut os = ObjectState::new(1 << 24, Endian::Little);
        os.write_at(100, &il::expr_const(0x41, 8)).unwrap();
        os.write_at(200, &il::expr_scalar("v", 8)).unwrap();
        assert_eq!(os.num_concrete(), (1 << 24) - 1);

        os.write(&offset("i"), &il::expr_const(0xff, 8)).unwrap();
        let runs = match os.updates().updates()[0] {
            Update::Layer(ref runs) => runs.clone(),
            ref update => panic!("expected a layer, found {:?}", update),
        };
        let shape: Vec<(u64, u64)> = runs.iter().map(|run| (run.offset(), run.len())).collect();
        assert_eq!(
            shape,
            vec![(0, 100), (100, 1), (101, 99), (200, 1), (201, (1 << 24) - 201)]
        );
        assert_eq!(runs[3].value(), &il::expr_scalar("v", 8));
        assert_eq!(os.num_concrete(), 0);
        assert_eq!(os.byte(200), Some(Byte::Flushed));
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut os = ObjectState::new(4, Endian::Little);
        os.set_read_only(true);
        assert!(matches!(
            os.write_at(0, &il::expr_const(1, 8)),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(
            os.write(&offset("i"), &il::expr_const(1, 8)),
            Err(Error::ReadOnly)
        ));
        assert_eq!(os.read_at(0, 8).unwrap(), il::expr_const(0, 8));
        assert!(os.updates().is_empty());
    }

    #[test]
    fn rejects_bad_widths_and_bounds() {
        let os = ObjectState::new(4, Endian::Little);
        assert!(matches!(os.read_at(0, 12), Err(Error::BadWidth(12))));
        assert!(matches!(os.read_at(2, 32), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn initializers() {
        let mut os = ObjectState::new_symbolic(2, "buf", Endian::Little);
        os.initialize_to_random();
        assert_eq!(os.read_at(0, 16).unwrap(), il::expr_const(0xabab, 16));
        os.initialize_to_zero();
        assert_eq!(os.read_at(0, 16).unwrap(), il::expr_const(0, 16));
    }
}
