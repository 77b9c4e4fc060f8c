//! Domain primitives: identifiers and non-empty id sets.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Coach account identifier.
    CoachId
);
string_id!(
    /// Buyer (customer) identifier.
    BuyerId
);
string_id!(
    /// Customer segment identifier, used by segment eligibility.
    SegmentId
);
string_id!(
    /// Session type identifier.
    SessionTypeId
);
string_id!(
    /// Program identifier.
    ProgramId
);
string_id!(
    /// Time-based rate or special period identifier.
    RuleId
);
string_id!(DiscountId);
string_id!(PaymentId);
string_id!(
    /// Upstream refund event identifier (de-duplication key component).
    RefundEventId
);
string_id!(AdjustmentId);
string_id!(
    /// Payout batch identifier.
    BatchId
);

/// A set of ids that is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
#[serde(bound(
    serialize = "T: Serialize + Clone + Ord",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct IdSet<T: Ord>(BTreeSet<T>);

impl<T: Ord> IdSet<T> {
    /// Build a non-empty set; `field` names the set in the validation error.
    pub fn new(
        ids: impl IntoIterator<Item = T>,
        field: &'static str,
    ) -> Result<Self, ValidationError> {
        let set: BTreeSet<T> = ids.into_iter().collect();
        if set.is_empty() {
            return Err(ValidationError::EmptySet(field));
        }
        Ok(IdSet(set))
    }

    pub fn contains(&self, id: &T) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; present for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Smallest id shared with `other`, if any.
    pub fn first_shared<'a>(&'a self, other: &'a IdSet<T>) -> Option<&'a T> {
        self.0.intersection(&other.0).next()
    }
}

impl<T: Ord> TryFrom<Vec<T>> for IdSet<T> {
    type Error = ValidationError;

    fn try_from(value: Vec<T>) -> Result<Self, Self::Error> {
        IdSet::new(value, "id set")
    }
}

impl<T: Ord + Clone> From<IdSet<T>> for Vec<T> {
    fn from(value: IdSet<T>) -> Self {
        value.0.into_iter().collect()
    }
}
