//! In-memory object descriptor: a plain descriptor struct plus a small side channel of
//! lifecycle flags.

use parking_lot::RwLock;

use crate::ids::ObjId;

/// A tiny hand-rolled bitflags, to avoid pulling in an extra dependency for a three-bit set a
/// plain `u8` newtype with associated consts handles just as well.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }
    };
}

bitflags_like! {
    /// Lifecycle bitset: exactly the three bits below, never extended speculatively.
    pub struct LayoutState: u8 {
        const UNCOMMITTED = 1 << 0;
        const COMMITTED   = 1 << 1;
        const REMOVED     = 1 << 2;
    }
}

/// Device/zone extent descriptor, `{pdh, zaddr, zcnt}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDevice {
    /// Index of the owning device within the pool's device table.
    pub pdh:   u16,
    /// First zone of the extent.
    pub zaddr: u64,
    /// Number of zones in the extent.
    pub zcnt:  u32,
}

/// The mutable part of a [`Layout`]: everything that changes across the object's lifecycle,
/// guarded together by the layout's own `rwlock`.
#[derive(Debug, Clone, Copy)]
pub struct LayoutMut {
    pub state:  LayoutState,
    /// mlog generation; monotonically increasing, bumped only by `obj_erase`.
    pub gen:    u64,
    /// Reference count; lifecycle ops treat `refcnt <= 2` as "not externally held".
    pub refcnt: u32,
    pub isdel:  bool,
    /// Written length of an mblock; unused (stays 0) for mlogs.
    pub mblen:  u64,
}

impl LayoutMut {
    #[must_use]
    const fn new_uncommitted() -> Self {
        Self { state: LayoutState::UNCOMMITTED, gen: 0, refcnt: 1, isdel: false, mblen: 0 }
    }
}

/// The in-memory representation of one mblock or mlog.
///
/// `objid`, `ld`, and the object's type never change after construction; everything that does
/// change lives behind `mutable` so that a single lock covers the whole lifecycle-transition
/// surface.
#[derive(Debug)]
pub struct Layout {
    pub objid:   ObjId,
    pub ld:      LayoutDevice,
    pub mutable: RwLock<LayoutMut>,
}

impl Layout {
    #[must_use]
    pub fn new_uncommitted(objid: ObjId, ld: LayoutDevice) -> Self {
        Self { objid, ld, mutable: RwLock::new(LayoutMut::new_uncommitted()) }
    }

    #[must_use]
    pub fn state(&self) -> LayoutState {
        self.mutable.read().state
    }

    #[must_use]
    pub fn gen(&self) -> u64 {
        self.mutable.read().gen
    }

    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.mutable.read().refcnt
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state().contains(LayoutState::COMMITTED)
    }
}
