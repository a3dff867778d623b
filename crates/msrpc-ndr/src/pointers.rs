//! NDR pointer types
//!
//! NDR supports three pointer semantics:
//!
//! - Reference (`[ref]`): Non-null. At top level the data follows inline; when
//!   embedded, a non-zero referent id is written and the body is deferred
//! - Unique (`[unique]`): Nullable referent id, body deferred, no aliasing
//! - Full (`[ptr]`): Nullable referent id, aliasing allowed; a target seen
//!   twice in one message is transmitted once
//!
//! Deferred bodies are queued on the writer/reader and emitted after the
//! fixed part of the enclosing structure, in the order the pointers were
//! encountered. Bodies queued while a body is being processed are flushed
//! immediately after it (depth first).

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::{
    NdrDecode, NdrDecodeOwned, NdrEncode, NdrError, NdrReader, NdrWriter, PointerWidth, Result,
};

/// First referent id handed out in a message
pub const FIRST_REFERENT: u64 = 0x0002_0000;
/// Distance between consecutive referent ids
pub const REFERENT_STEP: u64 = 4;

/// Issues referent ids for one marshal call
#[derive(Debug)]
pub(crate) struct ReferentAllocator {
    next: u64,
    shared: HashMap<usize, u64>,
}

impl Default for ReferentAllocator {
    fn default() -> Self {
        Self {
            next: FIRST_REFERENT,
            shared: HashMap::new(),
        }
    }
}

impl ReferentAllocator {
    pub(crate) fn fresh(&mut self) -> u64 {
        let id = self.next;
        self.next += REFERENT_STEP;
        id
    }

    /// Id for a shared target, and whether this is its first appearance
    fn for_identity(&mut self, identity: usize) -> (u64, bool) {
        if let Some(&id) = self.shared.get(&identity) {
            return (id, false);
        }
        let id = self.fresh();
        self.shared.insert(identity, id);
        (id, true)
    }
}

type Waiter<'a> = Box<dyn FnOnce(&Rc<dyn Any>) -> Result<()> + 'a>;

enum SharedReferent<'a> {
    /// Body queued but not yet decoded
    Pending(Vec<Waiter<'a>>),
    Ready(Rc<dyn Any>),
}

/// Referent ids seen during one unmarshal call
#[derive(Default)]
pub(crate) struct ReferentRegistry<'a> {
    unique: HashSet<u64>,
    shared: HashMap<u64, SharedReferent<'a>>,
}

impl<'a> ReferentRegistry<'a> {
    /// Record a unique referent; false if the id was already used
    fn claim_unique(&mut self, id: u64) -> bool {
        !self.shared.contains_key(&id) && self.unique.insert(id)
    }

    fn resolve(&mut self, id: u64, value: Rc<dyn Any>) -> Vec<Waiter<'a>> {
        match self.shared.insert(id, SharedReferent::Ready(value)) {
            Some(SharedReferent::Pending(waiters)) => waiters,
            _ => Vec::new(),
        }
    }
}

fn downcast_shared<T: 'static>(value: &Rc<dyn Any>, referent: u64) -> Result<Rc<T>> {
    Rc::clone(value)
        .downcast::<T>()
        .map_err(|_| NdrError::ProtocolViolation {
            referent,
            reason: "full pointer referent reused for a different type",
        })
}

impl<'a> NdrWriter<'a> {
    /// Write a referent id in the context's pointer width
    pub fn write_referent(&mut self, id: u64) -> Result<()> {
        match self.context().format.pointer_width {
            PointerWidth::U32 => {
                let id = u32::try_from(id).map_err(|_| NdrError::Range {
                    what: "referent id",
                    value: id,
                    max: u64::from(u32::MAX),
                })?;
                self.write_u32(id);
            }
            PointerWidth::U64 => self.write_u64(id),
        }
        Ok(())
    }

    pub fn write_null_pointer(&mut self) -> Result<()> {
        self.write_referent(0)
    }

    /// Unique pointer: id 0 for `None`, otherwise a fresh id with the body
    /// queued for the deferred phase.
    pub fn write_pointer<T, F>(&mut self, target: Option<&'a T>, body: F) -> Result<()>
    where
        T: ?Sized + 'a,
        F: FnOnce(&mut NdrWriter<'a>, &'a T) -> Result<()> + 'a,
    {
        let Some(value) = target else {
            return self.write_null_pointer();
        };
        let id = self.referents.fresh();
        self.write_referent(id)?;
        trace!(referent = id, offset = self.position(), "deferring pointer body");
        self.defer(move |w| body(w, value));
        Ok(())
    }

    /// Embedded reference pointer: never null, so always a fresh id
    pub fn write_ref_pointer<T, F>(&mut self, target: &'a T, body: F) -> Result<()>
    where
        T: ?Sized + 'a,
        F: FnOnce(&mut NdrWriter<'a>, &'a T) -> Result<()> + 'a,
    {
        self.write_pointer(Some(target), body)
    }

    /// Full pointer: targets are identified by their `Rc` allocation, and
    /// repeated targets reuse the first id without a second body.
    pub fn write_full_pointer<T, F>(&mut self, target: Option<&'a Rc<T>>, body: F) -> Result<()>
    where
        T: 'a,
        F: FnOnce(&mut NdrWriter<'a>, &'a T) -> Result<()> + 'a,
    {
        let Some(shared) = target else {
            return self.write_null_pointer();
        };
        let (id, first) = self.referents.for_identity(Rc::as_ptr(shared) as usize);
        self.write_referent(id)?;
        if first {
            let value: &'a T = shared;
            self.defer(move |w| body(w, value));
        } else {
            debug!(referent = id, "full pointer alias, body already queued");
        }
        Ok(())
    }

    /// Queue a body for the deferred phase
    pub fn defer<F>(&mut self, body: F)
    where
        F: FnOnce(&mut NdrWriter<'a>) -> Result<()> + 'a,
    {
        self.deferred.push(Box::new(body));
    }

    /// Number of bodies waiting for the deferred phase
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Emit every queued body, each followed by the bodies it queued
    pub fn flush_deferred(&mut self) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        self.depth += 1;
        let limit = self.context().limits.max_depth;
        if self.depth > limit {
            warn!(depth = self.depth, "pointer nesting too deep");
            return Err(NdrError::Range {
                what: "pointer nesting depth",
                value: self.depth as u64,
                max: limit as u64,
            });
        }
        let queue = std::mem::take(&mut self.deferred);
        for body in queue {
            body(self)?;
            self.flush_deferred()?;
        }
        self.depth -= 1;
        Ok(())
    }
}

impl<'a> NdrReader<'a> {
    /// Read a referent id in the context's pointer width
    pub fn read_referent(&mut self) -> Result<u64> {
        match self.context().format.pointer_width {
            PointerWidth::U32 => self.read_u32().map(u64::from),
            PointerWidth::U64 => self.read_u64(),
        }
    }

    /// Unique pointer. A non-zero id fills `slot` with a default value during
    /// the deferred phase and hands it to `body` to decode in place.
    pub fn read_pointer<T, F>(&mut self, slot: &'a mut Option<T>, body: F) -> Result<()>
    where
        T: Default + 'a,
        F: FnOnce(&mut NdrReader<'a>, &'a mut T) -> Result<()> + 'a,
    {
        let id = self.read_referent()?;
        if id == 0 {
            *slot = None;
            return Ok(());
        }
        if !self.referents.claim_unique(id) {
            warn!(referent = id, "referent id reused by a unique pointer");
            return Err(NdrError::ProtocolViolation {
                referent: id,
                reason: "unique referent id reused",
            });
        }
        self.defer(move |r| {
            r.expect_body(id)?;
            let value = slot.insert(T::default());
            body(r, value).map_err(|e| e.in_deferred_body(id))
        });
        Ok(())
    }

    /// Full pointer. The first occurrence of an id decodes the body; later
    /// occurrences share the same `Rc`, even if they are seen before the
    /// body has been reached.
    pub fn read_full_pointer<T, F>(&mut self, slot: &'a mut Option<Rc<T>>, body: F) -> Result<()>
    where
        T: 'static,
        F: FnOnce(&mut NdrReader<'a>) -> Result<T> + 'a,
    {
        let id = self.read_referent()?;
        if id == 0 {
            *slot = None;
            return Ok(());
        }
        if self.referents.unique.contains(&id) {
            return Err(NdrError::ProtocolViolation {
                referent: id,
                reason: "referent id used by both unique and full pointers",
            });
        }
        match self.referents.shared.get_mut(&id) {
            Some(SharedReferent::Ready(value)) => {
                *slot = Some(downcast_shared(value, id)?);
            }
            Some(SharedReferent::Pending(waiters)) => {
                waiters.push(Box::new(move |value| {
                    *slot = Some(downcast_shared(value, id)?);
                    Ok(())
                }));
            }
            None => {
                self.referents.shared.insert(id, SharedReferent::Pending(Vec::new()));
                self.defer(move |r| {
                    r.expect_body(id)?;
                    let value = Rc::new(body(r).map_err(|e| e.in_deferred_body(id))?);
                    let erased: Rc<dyn Any> = value.clone();
                    for waiter in r.referents.resolve(id, Rc::clone(&erased)) {
                        waiter(&erased)?;
                    }
                    *slot = Some(value);
                    Ok(())
                });
            }
        }
        Ok(())
    }

    /// Queue a body for the deferred phase
    pub fn defer<F>(&mut self, body: F)
    where
        F: FnOnce(&mut NdrReader<'a>) -> Result<()> + 'a,
    {
        self.deferred.push(Box::new(body));
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Decode every queued body, each followed by the bodies it queued
    pub fn flush_deferred(&mut self) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        self.depth += 1;
        let limit = self.context().limits.max_depth;
        if self.depth > limit {
            warn!(depth = self.depth, "pointer nesting too deep");
            return Err(NdrError::Range {
                what: "pointer nesting depth",
                value: self.depth as u64,
                max: limit as u64,
            });
        }
        let queue = std::mem::take(&mut self.deferred);
        for body in queue {
            body(self)?;
            self.flush_deferred()?;
        }
        self.depth -= 1;
        Ok(())
    }
}

/// Reference pointer - non-null, data follows inline
///
/// The `[ref]` attribute in MIDL used as a top-level parameter. The pointer
/// itself is not transmitted; the pointee data is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefPtr<T>(pub T);

impl<T> RefPtr<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for RefPtr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: NdrEncode> NdrEncode for RefPtr<T> {
    fn ndr_prepare(&mut self) -> Result<()> {
        self.0.ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        self.0.ndr_encode(w)
    }
}

impl<T: NdrDecode> NdrDecode for RefPtr<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        self.0.ndr_decode(r)
    }
}

/// Unique pointer - nullable, no aliasing
///
/// The `[unique]` attribute in MIDL: a referent id (0 = null) in the fixed
/// part, with the pointee in the deferred part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniquePtr<T>(pub Option<Box<T>>);

impl<T> UniquePtr<T> {
    pub fn new(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn null() -> Self {
        Self(None)
    }

    pub fn into_option(self) -> Option<T> {
        self.0.map(|b| *b)
    }

    pub fn as_ref(&self) -> Option<&T> {
        self.0.as_deref()
    }

    pub fn as_mut(&mut self) -> Option<&mut T> {
        self.0.as_deref_mut()
    }
}

impl<T> Default for UniquePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Option<T>> for UniquePtr<T> {
    fn from(opt: Option<T>) -> Self {
        Self(opt.map(Box::new))
    }
}

impl<T: NdrEncode> NdrEncode for UniquePtr<T> {
    fn ndr_prepare(&mut self) -> Result<()> {
        match self.as_mut() {
            Some(value) => value.ndr_prepare(),
            None => Ok(()),
        }
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_pointer(self.0.as_deref(), |w, value| value.ndr_encode(w))
    }
}

impl<T: NdrDecode + Default> NdrDecode for UniquePtr<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        r.read_pointer(&mut self.0, |r, value| value.ndr_decode(r))
    }

    fn ndr_min_size() -> usize {
        4
    }
}

/// Full pointer - nullable, aliasing allowed
///
/// The `[ptr]` attribute in MIDL. Clones of the same `Rc` encode as one
/// referent, and decode back into clones of one `Rc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPtr<T>(pub Option<Rc<T>>);

impl<T> FullPtr<T> {
    pub fn new(value: T) -> Self {
        Self(Some(Rc::new(value)))
    }

    pub fn null() -> Self {
        Self(None)
    }

    pub fn as_ref(&self) -> Option<&T> {
        self.0.as_deref()
    }

    /// Whether both pointers refer to the same target
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Default for FullPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Rc<T>> for FullPtr<T> {
    fn from(target: Rc<T>) -> Self {
        Self(Some(target))
    }
}

impl<T: NdrEncode> NdrEncode for FullPtr<T> {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_full_pointer(self.0.as_ref(), |w, value| value.ndr_encode(w))
    }
}

impl<T: NdrDecodeOwned + 'static> NdrDecode for FullPtr<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        r.read_full_pointer(&mut self.0, T::ndr_decode_owned)
    }

    fn ndr_min_size() -> usize {
        4
    }
}
