//! The allocation algebra.
//!
//! A [`SimpleAllocationOutcome`] is the value both the funding protocols and
//! the ledger reallocation protocol compute over. Every operation here is
//! pure and returns a fresh value; the ledger protocol relies on that to
//! evaluate would-be outcomes speculatively before deciding to propose them.

use std::collections::BTreeSet;

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sluice_primitives::{amount::Amount, signature::Address};

use crate::{
    errors::{StateError, StateResult},
    state::Destination,
};

/// One (destination, amount) entry of an allocation.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Arbitrary,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct AllocationItem {
    destination: Destination,
    amount: Amount,
}

impl AllocationItem {
    pub fn new(destination: Destination, amount: Amount) -> Self {
        Self {
            destination,
            amount,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }
}

/// An ordered list of allocation items for a single asset holder, with each
/// destination appearing at most once.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct SimpleAllocationOutcome {
    asset_holder: Address,
    items: Vec<AllocationItem>,
}

impl SimpleAllocationOutcome {
    /// Builds an outcome, rejecting repeated destinations.
    pub fn new(asset_holder: Address, items: Vec<AllocationItem>) -> StateResult<Self> {
        let mut seen = BTreeSet::new();
        for item in &items {
            if !seen.insert(*item.destination()) {
                return Err(StateError::DuplicateDestination(*item.destination()));
            }
        }
        Ok(Self {
            asset_holder,
            items,
        })
    }

    pub fn asset_holder(&self) -> &Address {
        &self.asset_holder
    }

    pub fn items(&self) -> &[AllocationItem] {
        &self.items
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.items.iter().map(AllocationItem::destination)
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.balance_for(destination).is_some()
    }

    pub fn balance_for(&self, destination: &Destination) -> Option<Amount> {
        self.items
            .iter()
            .find(|item| item.destination() == destination)
            .map(AllocationItem::amount)
    }

    /// Total allocated amount, `None` on overflow.
    pub fn total(&self) -> Option<Amount> {
        Amount::checked_sum(self.items.iter().map(AllocationItem::amount))
    }

    /// Cumulative amount allocated before (and excluding) `destination`,
    /// used to work out how much on-chain funding must exist before our
    /// deposit is safe.
    pub fn allocated_before(&self, destination: &Destination) -> Option<Amount> {
        Amount::checked_sum(
            self.items
                .iter()
                .take_while(|item| item.destination() != destination)
                .map(AllocationItem::amount),
        )
    }

    /// Moves funds from each source into `destination`, appending it (or
    /// merging into an existing entry).
    ///
    /// Returns `None` when not applicable: a source is missing, a source
    /// balance is short, or arithmetic overflows. The total is conserved.
    pub fn add(
        &self,
        destination: Destination,
        sources: &[(Destination, Amount)],
    ) -> Option<Self> {
        let mut items = self.items.clone();
        let mut moved = Amount::ZERO;

        for (source, contribution) in sources {
            let item = items.iter_mut().find(|i| i.destination() == source)?;
            item.amount = item.amount.checked_sub(*contribution)?;
            moved = moved.checked_add(*contribution)?;
        }

        match items.iter_mut().find(|i| i.destination() == &destination) {
            Some(existing) => existing.amount = existing.amount.checked_add(moved)?,
            None => items.push(AllocationItem::new(destination, moved)),
        }

        Some(Self {
            asset_holder: self.asset_holder,
            items,
        })
    }

    /// Removes `destination`, distributing its balance onto the refund
    /// destinations (creating entries where absent).
    ///
    /// Returns `None` unless `destination` exists and the refunds sum to
    /// exactly its balance. The total is conserved.
    pub fn remove(
        &self,
        destination: &Destination,
        refunds: &[(Destination, Amount)],
    ) -> Option<Self> {
        let balance = self.balance_for(destination)?;
        let refunded = Amount::checked_sum(refunds.iter().map(|(_, a)| *a))?;
        if refunded != balance {
            return None;
        }

        let mut items: Vec<AllocationItem> = self
            .items
            .iter()
            .filter(|i| i.destination() != destination)
            .copied()
            .collect();

        for (refund_dest, amount) in refunds {
            match items.iter_mut().find(|i| i.destination() == refund_dest) {
                Some(existing) => existing.amount = existing.amount.checked_add(*amount)?,
                None => items.push(AllocationItem::new(*refund_dest, *amount)),
            }
        }

        Some(Self {
            asset_holder: self.asset_holder,
            items,
        })
    }

    /// Keeps only the items that appear identically (destination and
    /// amount) in both outcomes, preserving our order.
    pub fn intersect(&self, other: &Self) -> Self {
        let items = self
            .items
            .iter()
            .filter(|item| other.balance_for(item.destination()) == Some(item.amount()))
            .copied()
            .collect();
        Self {
            asset_holder: self.asset_holder,
            items,
        }
    }

    /// The destinations whose (destination, amount) pair appears in exactly
    /// one of the two outcomes, i.e. everything that changed between them.
    pub fn xor(&self, other: &Self) -> BTreeSet<Destination> {
        let mut changed = BTreeSet::new();
        for item in &self.items {
            if other.balance_for(item.destination()) != Some(item.amount()) {
                changed.insert(*item.destination());
            }
        }
        for item in &other.items {
            if self.balance_for(item.destination()) != Some(item.amount()) {
                changed.insert(*item.destination());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use sluice_primitives::buf::Buf32;

    use super::*;

    fn dest(tag: u8) -> Destination {
        Buf32::new([tag; 32])
    }

    fn outcome(entries: &[(u8, u64)]) -> SimpleAllocationOutcome {
        SimpleAllocationOutcome::new(
            Address::zero(),
            entries
                .iter()
                .map(|(tag, amt)| AllocationItem::new(dest(*tag), Amount::from(*amt)))
                .collect(),
        )
        .expect("test outcome should build")
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let items = vec![
            AllocationItem::new(dest(1), 1u64.into()),
            AllocationItem::new(dest(1), 2u64.into()),
        ];
        assert!(matches!(
            SimpleAllocationOutcome::new(Address::zero(), items),
            Err(StateError::DuplicateDestination(_))
        ));
    }

    #[test]
    fn test_add_conserves_total() {
        let before = outcome(&[(1, 5), (2, 5)]);
        let after = before
            .add(dest(3), &[(dest(1), 1u64.into()), (dest(2), 1u64.into())])
            .expect("add should apply");

        assert_eq!(after.balance_for(&dest(1)), Some(Amount::from(2)));
        assert_eq!(after.balance_for(&dest(2)), Some(Amount::from(4)));
        assert_eq!(after.balance_for(&dest(3)), Some(Amount::from(2)));
        assert_eq!(before.total(), after.total(), "total must be conserved");
    }

    #[test]
    fn test_add_insufficient_source() {
        let before = outcome(&[(1, 1)]);
        assert!(
            before.add(dest(3), &[(dest(1), 2u64.into())]).is_none(),
            "short source must fail the whole operation"
        );
        assert!(before.add(dest(3), &[(dest(9), 1u64.into())]).is_none());
    }

    #[test]
    fn test_add_merges_existing_destination() {
        let before = outcome(&[(1, 5), (3, 1)]);
        let after = before
            .add(dest(3), &[(dest(1), 2u64.into())])
            .expect("add should apply");
        assert_eq!(after.balance_for(&dest(3)), Some(Amount::from(3)));
        assert_eq!(after.items().len(), 2);
    }

    #[test]
    fn test_remove_requires_exact_refund() {
        let before = outcome(&[(1, 5), (2, 5), (3, 10)]);

        // short refund
        assert!(before
            .remove(&dest(3), &[(dest(1), 4u64.into()), (dest(2), 5u64.into())])
            .is_none());

        let after = before
            .remove(&dest(3), &[(dest(1), 5u64.into()), (dest(2), 5u64.into())])
            .expect("exact refund should apply");
        assert!(!after.contains(&dest(3)));
        assert_eq!(after.balance_for(&dest(1)), Some(Amount::from(10)));
        assert_eq!(before.total(), after.total(), "total must be conserved");
    }

    #[test]
    fn test_remove_creates_refund_entries() {
        let before = outcome(&[(3, 10)]);
        let after = before
            .remove(&dest(3), &[(dest(1), 10u64.into())])
            .expect("refund to a fresh destination should apply");
        assert_eq!(after.balance_for(&dest(1)), Some(Amount::from(10)));
    }

    #[test]
    fn test_intersect_keeps_identical_pairs() {
        let a = outcome(&[(1, 5), (2, 5), (3, 1)]);
        let b = outcome(&[(1, 5), (2, 4), (4, 1)]);
        let both = a.intersect(&b);
        assert_eq!(both.items().len(), 1);
        assert_eq!(both.balance_for(&dest(1)), Some(Amount::from(5)));
    }

    #[test]
    fn test_xor_reports_changed_destinations() {
        let a = outcome(&[(1, 5), (2, 5), (3, 1)]);
        let b = outcome(&[(1, 5), (2, 4), (4, 1)]);
        let changed = a.xor(&b);
        assert_eq!(
            changed,
            [dest(2), dest(3), dest(4)].into_iter().collect(),
            "amount change and presence change both count"
        );
        assert!(a.xor(&a).is_empty());
    }

    #[test]
    fn test_allocated_before() {
        let a = outcome(&[(1, 5), (2, 7), (3, 1)]);
        assert_eq!(a.allocated_before(&dest(1)), Some(Amount::ZERO));
        assert_eq!(a.allocated_before(&dest(3)), Some(Amount::from(12)));
    }
}
