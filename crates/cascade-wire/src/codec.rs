//! Binary rule encoding.
//!
//! Every structure is a block: a `u32` big-endian size counting the whole
//! block (prefix included), a `u8` type tag, then the payload. Children are
//! nested blocks that must exactly fill their parent's payload. Decoding is
//! strict, so any accepted input re-encodes to the same bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ast::{Action, ActionBlock, Atomic, Condition, ConstId, Rule, Term, VarId};
use crate::error::WireError;

/// Size prefix plus type tag.
pub const BLOCK_HEADER_LEN: usize = 5;

/// Deepest nesting the decoder follows before giving up.
pub const MAX_DEPTH: usize = 256;

mod tag {
    pub const TERM_VARIABLE: u8 = 0;
    pub const TERM_CONSTANT: u8 = 1;
    pub const TERM_LIST: u8 = 2;
    pub const TERM_FUNCTION: u8 = 3;

    pub const ATOMIC_ATOM: u8 = 0;
    pub const ATOMIC_BUILTIN: u8 = 1;
    pub const ATOMIC_EQUALITY: u8 = 2;
    pub const ATOMIC_MEMBERSHIP: u8 = 3;
    pub const ATOMIC_SUBCLASS: u8 = 4;
    pub const ATOMIC_FRAME: u8 = 5;

    pub const CONDITION_ATOMIC: u8 = 0;
    pub const CONDITION_CONJUNCTION: u8 = 1;
    pub const CONDITION_DISJUNCTION: u8 = 2;
    pub const CONDITION_NEGATION: u8 = 3;
    pub const CONDITION_EXISTENTIAL: u8 = 4;

    pub const ACTION_ASSERT: u8 = 0;
    pub const ACTION_RETRACT: u8 = 1;
    pub const ACTION_RETRACT_SLOTS: u8 = 2;
    pub const ACTION_RETRACT_OBJECT: u8 = 3;
    pub const ACTION_EXECUTE: u8 = 4;
    pub const ACTION_MODIFY: u8 = 5;

    pub const ACTION_BLOCK: u8 = 0;
    pub const RULE: u8 = 0;
}

/// Types that can be written as a block.
pub trait Encode {
    fn encode_to(&self, out: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_to(&mut out);
        out.freeze()
    }
}

/// Types that can be read from a block.
pub trait Decode: Sized {
    /// Name used in error messages.
    const KIND: &'static str;

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError>;
}

/// Decode exactly one value that must fill `buf`.
pub fn decode<T: Decode>(buf: &[u8]) -> Result<T, WireError> {
    let mut reader = Reader::new(buf);
    let value = T::decode_from(&mut reader, 0)?;
    reader.finish(T::KIND)?;
    Ok(value)
}

/// Read the declared size of the block starting at `buf`.
pub fn peek_block_len(buf: &[u8]) -> Result<usize, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated {
            context: "size prefix",
            needed: 4,
            available: buf.len(),
        });
    }
    Ok((&buf[..4]).get_u32() as usize)
}

/// A bounds-checked cursor over a borrowed buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, context: &'static str, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                context,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        self.need(context, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, WireError> {
        self.need(context, 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64, WireError> {
        self.need(context, 8)?;
        Ok(self.buf.get_u64())
    }

    /// Split off the next block, returning its tag and a reader over its payload.
    pub fn block(&mut self, kind: &'static str) -> Result<(u8, Reader<'a>), WireError> {
        self.need(kind, BLOCK_HEADER_LEN)?;
        let declared = (&self.buf[..4]).get_u32() as usize;
        if declared < BLOCK_HEADER_LEN || declared > self.buf.remaining() {
            return Err(WireError::BadLength {
                kind,
                declared,
                available: self.buf.remaining(),
            });
        }
        let (block, rest) = self.buf.split_at(declared);
        self.buf = rest;
        let tag = block[4];
        Ok((tag, Reader::new(&block[BLOCK_HEADER_LEN..])))
    }

    /// Split off a size-prefixed sequence that carries no tag.
    fn untagged_block(&mut self, kind: &'static str) -> Result<Reader<'a>, WireError> {
        self.need(kind, 4)?;
        let declared = (&self.buf[..4]).get_u32() as usize;
        if declared < 4 || declared > self.buf.remaining() {
            return Err(WireError::BadLength {
                kind,
                declared,
                available: self.buf.remaining(),
            });
        }
        let (block, rest) = self.buf.split_at(declared);
        self.buf = rest;
        Ok(Reader::new(&block[4..]))
    }

    /// Fail unless the reader has been fully consumed.
    pub fn finish(&self, kind: &'static str) -> Result<(), WireError> {
        if self.buf.has_remaining() {
            return Err(WireError::TrailingBytes {
                kind,
                extra: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Decode children until the payload is exhausted.
    fn children<T: Decode>(&mut self, depth: usize) -> Result<Vec<T>, WireError> {
        let mut out = Vec::new();
        while !self.is_empty() {
            out.push(T::decode_from(self, depth)?);
        }
        Ok(out)
    }
}

fn check_depth(depth: usize) -> Result<usize, WireError> {
    if depth >= MAX_DEPTH {
        return Err(WireError::TooDeep(MAX_DEPTH));
    }
    Ok(depth + 1)
}

/// Write one block, patching the size prefix once the payload is known.
fn write_block(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let start = out.len();
    out.put_u32(0);
    out.put_u8(tag);
    body(out);
    patch_len(out, start);
}

fn patch_len(out: &mut BytesMut, start: usize) {
    let len = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

// ---------------------------------------------------------------- Term

impl Encode for Term {
    fn encode_to(&self, out: &mut BytesMut) {
        match self {
            Term::Variable(v) => write_block(out, tag::TERM_VARIABLE, |out| out.put_u32(*v)),
            Term::Constant(c) => write_block(out, tag::TERM_CONSTANT, |out| out.put_u64(*c)),
            Term::List(items) => write_block(out, tag::TERM_LIST, |out| {
                for item in items {
                    item.encode_to(out);
                }
            }),
            Term::Function(name, args) => write_block(out, tag::TERM_FUNCTION, |out| {
                out.put_u64(*name);
                for arg in args {
                    arg.encode_to(out);
                }
            }),
        }
    }
}

impl Decode for Term {
    const KIND: &'static str = "term";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        let term = match tag {
            tag::TERM_VARIABLE => Term::Variable(body.read_u32("variable id")?),
            tag::TERM_CONSTANT => Term::Constant(body.read_u64("constant id")?),
            tag::TERM_LIST => Term::List(body.children(depth)?),
            tag::TERM_FUNCTION => {
                let name: ConstId = body.read_u64("function name")?;
                Term::Function(name, body.children(depth)?)
            }
            tag => return Err(WireError::UnknownTag { kind: Self::KIND, tag }),
        };
        body.finish(Self::KIND)?;
        Ok(term)
    }
}

// ---------------------------------------------------------------- Atomic

impl Encode for Atomic {
    fn encode_to(&self, out: &mut BytesMut) {
        let pair = |tag: u8, a: &Term, b: &Term, out: &mut BytesMut| {
            write_block(out, tag, |out| {
                a.encode_to(out);
                b.encode_to(out);
            })
        };
        match self {
            Atomic::Atom { predicate, args } => write_block(out, tag::ATOMIC_ATOM, |out| {
                out.put_u64(*predicate);
                for arg in args {
                    arg.encode_to(out);
                }
            }),
            Atomic::Builtin { predicate, args } => write_block(out, tag::ATOMIC_BUILTIN, |out| {
                out.put_u64(*predicate);
                for arg in args {
                    arg.encode_to(out);
                }
            }),
            Atomic::Equality(a, b) => pair(tag::ATOMIC_EQUALITY, a, b, out),
            Atomic::Membership(a, b) => pair(tag::ATOMIC_MEMBERSHIP, a, b, out),
            Atomic::Subclass(a, b) => pair(tag::ATOMIC_SUBCLASS, a, b, out),
            Atomic::Frame { object, slots } => write_block(out, tag::ATOMIC_FRAME, |out| {
                object.encode_to(out);
                for (attr, value) in slots {
                    attr.encode_to(out);
                    value.encode_to(out);
                }
            }),
        }
    }
}

fn two_terms(body: &mut Reader<'_>, depth: usize) -> Result<(Term, Term), WireError> {
    let terms: Vec<Term> = body.children(depth)?;
    let found = terms.len();
    let mut it = terms.into_iter();
    match (it.next(), it.next(), it.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(WireError::Arity {
            kind: Atomic::KIND,
            found,
        }),
    }
}

impl Decode for Atomic {
    const KIND: &'static str = "atomic";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        let atomic = match tag {
            tag::ATOMIC_ATOM => {
                let predicate = body.read_u64("atom predicate")?;
                Atomic::Atom {
                    predicate,
                    args: body.children(depth)?,
                }
            }
            tag::ATOMIC_BUILTIN => {
                let predicate = body.read_u64("builtin predicate")?;
                Atomic::Builtin {
                    predicate,
                    args: body.children(depth)?,
                }
            }
            tag::ATOMIC_EQUALITY => {
                let (a, b) = two_terms(&mut body, depth)?;
                Atomic::Equality(a, b)
            }
            tag::ATOMIC_MEMBERSHIP => {
                let (a, b) = two_terms(&mut body, depth)?;
                Atomic::Membership(a, b)
            }
            tag::ATOMIC_SUBCLASS => {
                let (a, b) = two_terms(&mut body, depth)?;
                Atomic::Subclass(a, b)
            }
            tag::ATOMIC_FRAME => {
                let object = Term::decode_from(&mut body, depth)?;
                let mut slots = Vec::new();
                while !body.is_empty() {
                    let attr = Term::decode_from(&mut body, depth)?;
                    let value = Term::decode_from(&mut body, depth)?;
                    slots.push((attr, value));
                }
                Atomic::Frame { object, slots }
            }
            tag => return Err(WireError::UnknownTag { kind: Self::KIND, tag }),
        };
        body.finish(Self::KIND)?;
        Ok(atomic)
    }
}

// ---------------------------------------------------------------- Condition

impl Encode for Condition {
    fn encode_to(&self, out: &mut BytesMut) {
        let many = |tag: u8, items: &[Condition], out: &mut BytesMut| {
            write_block(out, tag, |out| {
                for item in items {
                    item.encode_to(out);
                }
            })
        };
        match self {
            Condition::Atomic(a) => write_block(out, tag::CONDITION_ATOMIC, |out| a.encode_to(out)),
            Condition::Conjunction(items) => many(tag::CONDITION_CONJUNCTION, items, out),
            Condition::Disjunction(items) => many(tag::CONDITION_DISJUNCTION, items, out),
            Condition::Negation(inner) => {
                write_block(out, tag::CONDITION_NEGATION, |out| inner.encode_to(out))
            }
            Condition::Existential(items) => many(tag::CONDITION_EXISTENTIAL, items, out),
        }
    }
}

impl Decode for Condition {
    const KIND: &'static str = "condition";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        let condition = match tag {
            tag::CONDITION_ATOMIC => Condition::Atomic(Atomic::decode_from(&mut body, depth)?),
            tag::CONDITION_CONJUNCTION => Condition::Conjunction(body.children(depth)?),
            tag::CONDITION_DISJUNCTION => Condition::Disjunction(body.children(depth)?),
            tag::CONDITION_NEGATION => {
                Condition::Negation(Box::new(Condition::decode_from(&mut body, depth)?))
            }
            tag::CONDITION_EXISTENTIAL => Condition::Existential(body.children(depth)?),
            tag => return Err(WireError::UnknownTag { kind: Self::KIND, tag }),
        };
        body.finish(Self::KIND)?;
        Ok(condition)
    }
}

// ---------------------------------------------------------------- Action

impl Encode for Action {
    fn encode_to(&self, out: &mut BytesMut) {
        let (tag, target) = match self {
            Action::AssertFact(a) => (tag::ACTION_ASSERT, a),
            Action::RetractFact(a) => (tag::ACTION_RETRACT, a),
            Action::RetractSlots(a) => (tag::ACTION_RETRACT_SLOTS, a),
            Action::RetractObject(term) => {
                return write_block(out, tag::ACTION_RETRACT_OBJECT, |out| term.encode_to(out));
            }
            Action::Execute(a) => (tag::ACTION_EXECUTE, a),
            Action::Modify(a) => (tag::ACTION_MODIFY, a),
        };
        write_block(out, tag, |out| target.encode_to(out));
    }
}

impl Decode for Action {
    const KIND: &'static str = "action";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        let action = match tag {
            tag::ACTION_ASSERT => Action::AssertFact(Atomic::decode_from(&mut body, depth)?),
            tag::ACTION_RETRACT => Action::RetractFact(Atomic::decode_from(&mut body, depth)?),
            tag::ACTION_RETRACT_SLOTS => {
                Action::RetractSlots(Atomic::decode_from(&mut body, depth)?)
            }
            tag::ACTION_RETRACT_OBJECT => {
                Action::RetractObject(Term::decode_from(&mut body, depth)?)
            }
            tag::ACTION_EXECUTE => Action::Execute(Atomic::decode_from(&mut body, depth)?),
            tag::ACTION_MODIFY => Action::Modify(Atomic::decode_from(&mut body, depth)?),
            tag => return Err(WireError::UnknownTag { kind: Self::KIND, tag }),
        };
        body.finish(Self::KIND)?;
        Ok(action)
    }
}

// ---------------------------------------------------------------- ActionBlock

impl Encode for ActionBlock {
    fn encode_to(&self, out: &mut BytesMut) {
        write_block(out, tag::ACTION_BLOCK, |out| {
            let start = out.len();
            out.put_u32(0);
            for (var, atomic) in &self.bindings {
                out.put_u32(*var);
                atomic.encode_to(out);
            }
            patch_len(out, start);
            for action in &self.actions {
                action.encode_to(out);
            }
        });
    }
}

impl Decode for ActionBlock {
    const KIND: &'static str = "action block";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        if tag != tag::ACTION_BLOCK {
            return Err(WireError::UnknownTag { kind: Self::KIND, tag });
        }
        let mut bindings_block = body.untagged_block("action bindings")?;
        let mut bindings = Vec::new();
        while !bindings_block.is_empty() {
            let var: VarId = bindings_block.read_u32("binding variable")?;
            let atomic = Atomic::decode_from(&mut bindings_block, depth)?;
            bindings.push((var, atomic));
        }
        let actions = body.children(depth)?;
        body.finish(Self::KIND)?;
        Ok(ActionBlock { bindings, actions })
    }
}

// ---------------------------------------------------------------- Rule

impl Encode for Rule {
    fn encode_to(&self, out: &mut BytesMut) {
        write_block(out, tag::RULE, |out| {
            self.condition.encode_to(out);
            self.actions.encode_to(out);
        });
    }
}

impl Decode for Rule {
    const KIND: &'static str = "rule";

    fn decode_from(reader: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        let depth = check_depth(depth)?;
        let (tag, mut body) = reader.block(Self::KIND)?;
        if tag != tag::RULE {
            return Err(WireError::UnknownTag { kind: Self::KIND, tag });
        }
        let condition = Condition::decode_from(&mut body, depth)?;
        let actions = ActionBlock::decode_from(&mut body, depth)?;
        body.finish(Self::KIND)?;
        Ok(Rule { condition, actions })
    }
}

// ---------------------------------------------------------------- Streams

/// Iterator over a flat concatenation of blocks, such as a rule file.
///
/// A block whose size prefix fits in the buffer but whose contents fail to
/// decode is reported as [`WireError::Malformed`] and skipped. A size prefix
/// that overruns the buffer is reported once and ends the stream, since no
/// later block boundary can be trusted.
pub struct BlockStream<'a, T> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<'a, T: Decode> BlockStream<'a, T> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Collect every decodable block, logging the ones that were skipped.
    ///
    /// Returns the error that ended the stream early, if any, alongside the
    /// values decoded before it.
    pub fn collect_lenient(self) -> (Vec<T>, Option<WireError>) {
        let mut values = Vec::new();
        let mut fatal = None;
        for item in self {
            match item {
                Ok(value) => values.push(value),
                Err(err @ WireError::Malformed { .. }) => {
                    tracing::error!(kind = T::KIND, error = %err, "skipping malformed block");
                }
                Err(err) => fatal = Some(err),
            }
        }
        (values, fatal)
    }
}

impl<T: Decode> Iterator for BlockStream<'_, T> {
    type Item = Result<T, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.offset..];
        let declared = match peek_block_len(rest) {
            Ok(len) if len >= BLOCK_HEADER_LEN && len <= rest.len() => len,
            Ok(len) => {
                self.failed = true;
                return Some(Err(WireError::BadLength {
                    kind: T::KIND,
                    declared: len,
                    available: rest.len(),
                }));
            }
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        let offset = self.offset;
        self.offset += declared;
        Some(decode::<T>(&rest[..declared]).map_err(|source| WireError::Malformed {
            offset,
            source: Box::new(source),
        }))
    }
}

/// Decode a rule file, skipping malformed rules.
pub fn decode_rules(buf: &[u8]) -> (Vec<Rule>, Option<WireError>) {
    BlockStream::<Rule>::new(buf).collect_lenient()
}

/// Decode a stream of conditions, such as a replication pattern file.
pub fn decode_conditions(buf: &[u8]) -> (Vec<Condition>, Option<WireError>) {
    BlockStream::<Condition>::new(buf).collect_lenient()
}
