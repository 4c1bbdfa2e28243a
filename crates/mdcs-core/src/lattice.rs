//! Join-semilattice trait - the convergence contract for stored records
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Replicas that join the same set of records in any order, any number of
//! times, end in the same state.

use std::cmp::Ordering;

/// A state that merges by least upper bound.
pub trait Lattice: Clone + PartialEq {
    /// Join operation (least upper bound).
    /// Must be commutative, associative, and idempotent.
    fn join(&self, other: &Self) -> Self;

    /// Partial order derived from join: a ≤ b iff a ⊔ b = b
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        let joined = self.join(other);
        if &joined == self && &joined == other {
            Some(Ordering::Equal)
        } else if &joined == other {
            Some(Ordering::Less)
        } else if &joined == self {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    /// Check if self ≤ other in the lattice order
    fn leq(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_lattice(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// Join-assign: self = self ⊔ other.
    ///
    /// Returns `true` when the state changed.
    fn join_assign(&mut self, other: &Self) -> bool {
        let joined = self.join(other);
        if &joined == self {
            return false;
        }
        *self = joined;
        true
    }
}

/// `None` is the bottom element: an absent record joins to whatever arrives.
impl<T: Lattice> Lattice for Option<T> {
    fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(a.join(b)),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        }
    }
}
