//! The neighbourhood data plane: a local value plus per-neighbour
//! overrides.
//!
//! A `Field<T>` is an ephemeral per-round quantity produced by
//! projecting the context at one call point. Reading it at a
//! neighbour uid yields that neighbour's override if present, else
//! the local default. The self uid is never stored as an override:
//! the default *is* the self value, which keeps the "self stored
//! exactly once" invariant by construction.

use crate::device::DeviceId;

/// A local value of type `T` with a sparse table of per-neighbour
/// overrides, sorted by ascending uid.
#[derive(Debug, Clone, PartialEq)]
pub struct Field<T> {
    self_id: DeviceId,
    default: T,
    entries: Vec<(DeviceId, T)>,
}

impl<T: Clone> Field<T> {
    /// A field with no overrides: every uid reads the default.
    pub fn uniform(self_id: DeviceId, default: T) -> Self {
        Field {
            self_id,
            default,
            entries: Vec::new(),
        }
    }

    /// Build a field from an override list.
    ///
    /// Entries are sorted by uid; a duplicate uid keeps the last
    /// value given; an entry for the self uid replaces the default
    /// instead of being stored.
    pub fn from_entries(
        self_id: DeviceId,
        default: T,
        mut entries: Vec<(DeviceId, T)>,
    ) -> Self {
        entries.sort_by_key(|(uid, _)| *uid);
        let mut field = Field {
            self_id,
            default,
            entries: Vec::with_capacity(entries.len()),
        };
        for (uid, value) in entries {
            if uid == self_id {
                field.default = value;
            } else if field.entries.last().map(|(u, _)| *u) == Some(uid) {
                field.entries.last_mut().unwrap().1 = value;
            } else {
                field.entries.push((uid, value));
            }
        }
        field
    }

    /// The uid this field is centred on.
    #[inline]
    pub fn self_id(&self) -> DeviceId {
        self.self_id
    }

    /// The local default value.
    #[inline]
    pub fn default(&self) -> &T {
        &self.default
    }

    /// Read the field at a uid: the override if present, else the
    /// default. O(log n).
    pub fn at(&self, uid: DeviceId) -> &T {
        match self.entries.binary_search_by_key(&uid, |(u, _)| *u) {
            Ok(i) => &self.entries[i].1,
            Err(_) => &self.default,
        }
    }

    /// Number of neighbour overrides (self excluded).
    #[inline]
    pub fn neighbour_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterate the neighbour overrides in ascending uid order.
    pub fn neighbours(&self) -> impl Iterator<Item = (DeviceId, &T)> {
        self.entries.iter().map(|(uid, v)| (*uid, v))
    }

    /// Apply `f` pointwise to the default and all overrides.
    pub fn map<U: Clone>(&self, f: impl Fn(&T) -> U) -> Field<U> {
        Field {
            self_id: self.self_id,
            default: f(&self.default),
            entries: self
                .entries
                .iter()
                .map(|(uid, v)| (*uid, f(v)))
                .collect(),
        }
    }

    /// Left-fold across the neighbourhood in ascending uid order,
    /// with the local value folded in exactly once at the position
    /// of the self uid.
    ///
    /// A field with no overrides folds to `op(init, default)`.
    pub fn fold<A>(&self, init: A, op: impl Fn(A, &T) -> A) -> A {
        let mut acc = init;
        let mut self_done = false;
        for (uid, v) in &self.entries {
            if !self_done && self.self_id < *uid {
                acc = op(acc, &self.default);
                self_done = true;
            }
            acc = op(acc, v);
        }
        if !self_done {
            acc = op(acc, &self.default);
        }
        acc
    }

    /// Pointwise combination over the union of neighbour sets; a uid
    /// missing from one side reads that side's default.
    pub fn combine<U: Clone, V: Clone>(
        &self,
        other: &Field<U>,
        f: impl Fn(&T, &U) -> V,
    ) -> Field<V> {
        debug_assert_eq!(self.self_id, other.self_id);
        let mut entries = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() || j < other.entries.len() {
            let ua = self.entries.get(i).map(|(u, _)| *u);
            let ub = other.entries.get(j).map(|(u, _)| *u);
            match (ua, ub) {
                (Some(a), Some(b)) if a == b => {
                    entries.push((a, f(&self.entries[i].1, &other.entries[j].1)));
                    i += 1;
                    j += 1;
                }
                (Some(a), Some(b)) if a < b => {
                    entries.push((a, f(&self.entries[i].1, &other.default)));
                    i += 1;
                }
                (Some(_), Some(b)) => {
                    entries.push((b, f(&self.default, &other.entries[j].1)));
                    j += 1;
                }
                (Some(a), None) => {
                    entries.push((a, f(&self.entries[i].1, &other.default)));
                    i += 1;
                }
                (None, Some(b)) => {
                    entries.push((b, f(&self.default, &other.entries[j].1)));
                    j += 1;
                }
                (None, None) => unreachable!(),
            }
        }
        Field {
            self_id: self.self_id,
            default: f(&self.default, &other.default),
            entries,
        }
    }

    /// Keep only the overrides whose uid satisfies the predicate.
    /// The default is unchanged.
    pub fn restrict(&self, pred: impl Fn(DeviceId) -> bool) -> Field<T> {
        Field {
            self_id: self.self_id,
            default: self.default.clone(),
            entries: self
                .entries
                .iter()
                .filter(|(uid, _)| pred(*uid))
                .cloned()
                .collect(),
        }
    }
}

impl<T: Clone + PartialOrd> Field<T> {
    /// The minimum value across the neighbourhood (self included).
    pub fn min_hood(&self) -> T {
        self.argmin().0
    }

    /// The minimum value and the uid holding it. When values are
    /// equal the smaller uid wins; several coordination primitives
    /// (unique-parent selection among them) rely on this tie-break.
    pub fn argmin(&self) -> (T, DeviceId) {
        let mut best_v = self.default.clone();
        let mut best_u = self.self_id;
        for (uid, v) in &self.entries {
            let strictly_less = *v < best_v;
            let equal = !strictly_less && !(best_v < *v);
            if strictly_less || (equal && *uid < best_u) {
                best_v = v.clone();
                best_u = *uid;
            }
        }
        (best_v, best_u)
    }
}
