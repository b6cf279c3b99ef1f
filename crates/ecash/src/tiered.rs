use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Amount, Error};

/// A value per denomination tier, ordered by tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tiered<T>(BTreeMap<Amount, T>);

impl<T> Default for Tiered<T> {
    fn default() -> Self {
        Tiered(BTreeMap::new())
    }
}

impl<T> Tiered<T> {
    pub fn insert(&mut self, tier: Amount, value: T) {
        self.0.insert(tier, value);
    }

    pub fn get(&self, tier: Amount) -> Option<&T> {
        self.0.get(&tier)
    }

    pub fn tiers(&self) -> impl DoubleEndedIterator<Item = Amount> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Amount, &T)> {
        self.0.iter().map(|(amount, value)| (*amount, value))
    }
}

impl<T> FromIterator<(Amount, T)> for Tiered<T> {
    fn from_iter<I: IntoIterator<Item = (Amount, T)>>(iter: I) -> Self {
        Tiered(iter.into_iter().collect())
    }
}

/// Multiple values per tier, e.g. all the notes of a holding or all the
/// blinded requests of one issuance. Per-tier order is significant: shares
/// returned by different members line up positionally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TieredMulti<T>(BTreeMap<Amount, Vec<T>>);

impl<T> Default for TieredMulti<T> {
    fn default() -> Self {
        TieredMulti(BTreeMap::new())
    }
}

impl<T> TieredMulti<T> {
    pub fn push(&mut self, tier: Amount, item: T) {
        self.0.entry(tier).or_default().push(item);
    }

    /// Total face value: sum of tier * count.
    pub fn total_amount(&self) -> Amount {
        Amount::from_sats(
            self.0
                .iter()
                .map(|(tier, items)| tier.sats * items.len() as u64)
                .sum(),
        )
    }

    pub fn item_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    pub fn get_tier(&self, tier: Amount) -> Option<&Vec<T>> {
        self.0.get(&tier)
    }

    pub fn iter_tiers(&self) -> impl Iterator<Item = (Amount, &Vec<T>)> {
        self.0.iter().map(|(amount, items)| (*amount, items))
    }

    pub fn iter_items(&self) -> impl Iterator<Item = (Amount, &T)> {
        self.0
            .iter()
            .flat_map(|(amount, items)| items.iter().map(move |item| (*amount, item)))
    }

    pub fn into_iter_items(self) -> impl Iterator<Item = (Amount, T)> {
        self.0
            .into_iter()
            .flat_map(|(amount, items)| items.into_iter().map(move |item| (amount, item)))
    }

    /// True if `other` has exactly the same tiers with the same number of
    /// items in each, so positional association between the two is valid.
    pub fn structure_matches<U>(&self, other: &TieredMulti<U>) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((t_a, v_a), (t_b, v_b))| t_a == t_b && v_a.len() == v_b.len())
    }
}

impl<T> FromIterator<(Amount, T)> for TieredMulti<T> {
    fn from_iter<I: IntoIterator<Item = (Amount, T)>>(iter: I) -> Self {
        let mut multi = TieredMulti::default();
        for (amount, item) in iter {
            multi.push(amount, item);
        }
        multi
    }
}

/// Split `amount` into configured denominations, preferring large tiers.
/// Fails if the remainder cannot be represented (i.e. the smallest tier
/// does not divide it).
pub fn split_amount(
    amount: Amount,
    tiers: impl DoubleEndedIterator<Item = Amount>,
) -> Result<Vec<Amount>, Error> {
    let mut remaining = amount.sats;
    let mut denominations = Vec::new();
    for tier in tiers.rev() {
        while remaining >= tier.sats {
            denominations.push(tier);
            remaining -= tier.sats;
        }
    }
    if remaining != 0 {
        return Err(Error::NotRepresentable(amount));
    }
    Ok(denominations)
}
