//! Location bitmask for message routing
//!
//! A routed message carries a set of destination flags: the local client,
//! the data-server group, the render-server group, or only the designated
//! root participant of either group. Flags combine by union; routing code
//! goes through the named predicates rather than raw bit tests.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Set of destinations a routed message targets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(u32);

impl Location {
    /// The local, in-process side of the session.
    pub const CLIENT: Location = Location(0x01);
    /// All participants of the data-server group.
    pub const DATA_SERVER: Location = Location(0x02);
    /// Only the root participant of the data-server group.
    pub const DATA_SERVER_ROOT: Location = Location(0x04);
    /// All participants of the render-server group.
    pub const RENDER_SERVER: Location = Location(0x10);
    /// Only the root participant of the render-server group.
    pub const RENDER_SERVER_ROOT: Location = Location(0x20);

    /// Empty set: no destinations.
    pub const fn empty() -> Self {
        Location(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Reconstruct from a wire value. Unknown bits are preserved verbatim;
    /// they simply never match any predicate.
    pub const fn from_bits(bits: u32) -> Self {
        Location(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Location) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn insert(self, other: Location) -> Self {
        Location(self.0 | other.0)
    }

    #[must_use]
    pub const fn remove(self, other: Location) -> Self {
        Location(self.0 & !other.0)
    }

    /// True if the local client is a destination.
    pub const fn targets_client(self) -> bool {
        self.contains(Location::CLIENT)
    }

    /// True if any data-server bit (all-participants or root-only) is set.
    pub const fn targets_data(self) -> bool {
        self.contains(Location::DATA_SERVER) || self.contains(Location::DATA_SERVER_ROOT)
    }

    pub const fn targets_data_root(self) -> bool {
        self.contains(Location::DATA_SERVER_ROOT)
    }

    /// True if any render-server bit (all-participants or root-only) is set.
    pub const fn targets_render(self) -> bool {
        self.contains(Location::RENDER_SERVER) || self.contains(Location::RENDER_SERVER_ROOT)
    }

    pub const fn targets_render_root(self) -> bool {
        self.contains(Location::RENDER_SERVER_ROOT)
    }
}

impl BitOr for Location {
    type Output = Location;

    fn bitor(self, rhs: Location) -> Location {
        Location(self.0 | rhs.0)
    }
}

impl BitOrAssign for Location {
    fn bitor_assign(&mut self, rhs: Location) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Location, &str); 5] = [
            (Location::CLIENT, "CLIENT"),
            (Location::DATA_SERVER, "DATA_SERVER"),
            (Location::DATA_SERVER_ROOT, "DATA_SERVER_ROOT"),
            (Location::RENDER_SERVER, "RENDER_SERVER"),
            (Location::RENDER_SERVER_ROOT, "RENDER_SERVER_ROOT"),
        ];

        if self.is_empty() {
            return write!(f, "Location(empty)");
        }

        write!(f, "Location(")?;
        let mut first = true;
        let mut rest = self.0;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
                rest &= !flag.0;
            }
        }
        if rest != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{rest:#x}")?;
        }
        write!(f, ")")
    }
}
