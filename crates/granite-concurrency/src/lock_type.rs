//! The lock-type lattice and its three relations.
//!
//! Everything here is a pure function; the lock manager and lock context
//! rely on these tables holding exactly.

use std::fmt;

/// Lock types for multigranularity locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum LockType {
    /// No lock held.
    NL,
    /// Intention shared: descendants will be read.
    IS,
    /// Intention exclusive: descendants will be written.
    IX,
    /// Shared: this resource and all descendants readable.
    S,
    /// Shared + intention exclusive: readable here, some descendants will
    /// be written.
    SIX,
    /// Exclusive: this resource and all descendants read/writable.
    X,
}

impl LockType {
    /// Whether a transaction holding `a` on a resource can coexist with
    /// another transaction holding `b` on the same resource.
    #[must_use]
    pub const fn compatible(a: Self, b: Self) -> bool {
        use LockType::{IS, IX, NL, S, SIX, X};
        match (a, b) {
            (NL, _) | (_, NL) => true,
            (X, _) | (_, X) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) | (S, S) => true,
            _ => false,
        }
    }

    /// The lock that must be held on the parent resource for a child lock
    /// of this type to be granted.
    #[must_use]
    pub const fn parent_lock(self) -> Self {
        use LockType::{IS, IX, NL, S, SIX, X};
        match self {
            S | IS => IS,
            X | IX | SIX => IX,
            NL => NL,
        }
    }

    /// Whether holding `parent` on a resource permits requesting `child` on
    /// one of its children.
    #[must_use]
    pub const fn can_be_parent_lock(parent: Self, child: Self) -> bool {
        use LockType::{IS, IX, NL, S, SIX, X};
        if matches!(child, NL) {
            return true;
        }
        match parent {
            NL => false,
            S => matches!(child, S),
            X => matches!(child, X),
            IS => matches!(child, IS | S),
            IX => true,
            SIX => !matches!(child, S | IS | SIX),
        }
    }

    /// Whether a held `substitute` lock grants every privilege a `required`
    /// lock would.
    #[must_use]
    pub const fn substitutable(substitute: Self, required: Self) -> bool {
        use LockType::{IS, IX, NL, S, SIX, X};
        if matches!(required, NL) {
            return true;
        }
        if matches!(substitute, NL) {
            return false;
        }
        if substitute as u8 == required as u8 {
            return true;
        }
        match substitute {
            X => true,
            S | IX => matches!(required, IS),
            SIX => !matches!(required, X),
            IS | NL => false,
        }
    }

    /// Whether this is one of the intent types {IS, IX, SIX}.
    #[must_use]
    pub const fn is_intent(self) -> bool {
        matches!(self, Self::IS | Self::IX | Self::SIX)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NL => "NL",
            Self::IS => "IS",
            Self::IX => "IX",
            Self::S => "S",
            Self::SIX => "SIX",
            Self::X => "X",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::LockType::{self, IS, IX, NL, S, SIX, X};

    const ALL: [LockType; 6] = [NL, IS, IX, S, SIX, X];

    #[test]
    fn test_compatibility_full_table() {
        // Row-major over (a, b); true means the pair may coexist.
        let expected = [
            // NL     IS     IX     S      SIX    X
            [true, true, true, true, true, true],    // NL
            [true, true, true, true, true, false],   // IS
            [true, true, true, false, false, false], // IX
            [true, true, false, true, false, false], // S
            [true, true, false, false, false, false],// SIX
            [true, false, false, false, false, false],// X
        ];
        for (i, &a) in ALL.iter().enumerate() {
            for (j, &b) in ALL.iter().enumerate() {
                assert_eq!(
                    LockType::compatible(a, b),
                    expected[i][j],
                    "compatible({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn test_compatibility_symmetric() {
        for &a in &ALL {
            for &b in &ALL {
                assert_eq!(LockType::compatible(a, b), LockType::compatible(b, a));
            }
        }
    }

    #[test]
    fn test_parent_lock() {
        assert_eq!(S.parent_lock(), IS);
        assert_eq!(X.parent_lock(), IX);
        assert_eq!(IS.parent_lock(), IS);
        assert_eq!(IX.parent_lock(), IX);
        assert_eq!(SIX.parent_lock(), IX);
        assert_eq!(NL.parent_lock(), NL);
    }

    #[test]
    fn test_can_be_parent_lock() {
        // NL child is always allowed; NL parent allows only NL.
        for &child in &ALL {
            assert_eq!(LockType::can_be_parent_lock(NL, child), child == NL);
            assert!(LockType::can_be_parent_lock(child, NL));
        }
        assert!(LockType::can_be_parent_lock(S, S));
        assert!(!LockType::can_be_parent_lock(S, X));
        assert!(LockType::can_be_parent_lock(X, X));
        assert!(LockType::can_be_parent_lock(IS, IS));
        assert!(LockType::can_be_parent_lock(IS, S));
        assert!(!LockType::can_be_parent_lock(IS, X));
        for &child in &ALL {
            assert!(LockType::can_be_parent_lock(IX, child));
        }
        assert!(LockType::can_be_parent_lock(SIX, X));
        assert!(LockType::can_be_parent_lock(SIX, IX));
        assert!(!LockType::can_be_parent_lock(SIX, S));
        assert!(!LockType::can_be_parent_lock(SIX, IS));
        assert!(!LockType::can_be_parent_lock(SIX, SIX));
    }

    #[test]
    fn test_substitutability_full_table() {
        // substitutable(substitute, required), row = substitute.
        let expected = [
            // NL     IS     IX     S      SIX    X
            [true, false, false, false, false, false], // NL
            [true, true, false, false, false, false],  // IS
            [true, true, true, false, false, false],   // IX
            [true, true, false, true, false, false],   // S
            [true, true, true, true, true, false],     // SIX
            [true, true, true, true, true, true],      // X
        ];
        for (i, &sub) in ALL.iter().enumerate() {
            for (j, &req) in ALL.iter().enumerate() {
                assert_eq!(
                    LockType::substitutable(sub, req),
                    expected[i][j],
                    "substitutable({sub}, {req})"
                );
            }
        }
    }

    #[test]
    fn test_is_intent() {
        assert!(IS.is_intent());
        assert!(IX.is_intent());
        assert!(SIX.is_intent());
        assert!(!S.is_intent());
        assert!(!X.is_intent());
        assert!(!NL.is_intent());
    }
}
