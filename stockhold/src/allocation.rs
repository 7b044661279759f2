//! FIFO allocation across the lots of one product.
//!
//! Planning is pure: it looks at lots and decides how many units each lot
//! contributes, without touching them. The coordinator checks every product's
//! plan before applying any of them, which is what makes multi-item
//! operations all-or-nothing.

use std::cmp::Ordering;

use crate::lot::InventoryLot;

/// Which per-lot quantity an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Units available for reservation.
    Available,
    /// Units currently reserved (release and sale).
    Reserved,
}

impl Bucket {
    fn of(self, lot: &InventoryLot) -> u32 {
        match self {
            Self::Available => lot.available_stock(),
            Self::Reserved => lot.reserved_quantity(),
        }
    }
}

/// Units taken from one lot, identified by its position in the lot slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Index into the lot slice the plan was computed from.
    pub lot_index: usize,
    /// Units moved for that lot.
    pub quantity: u32,
}

/// The lots together hold fewer units than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    /// Units asked for.
    pub requested: u64,
    /// Units the planned bucket held across all lots.
    pub held: u64,
}

/// Orders lots oldest first: by creation time, then by id.
pub fn fifo_order(left: &InventoryLot, right: &InventoryLot) -> Ordering {
    left.created_at()
        .cmp(&right.created_at())
        .then_with(|| left.id().cmp(&right.id()))
}

/// Sum of `bucket` across `lots`.
pub fn total(lots: &[InventoryLot], bucket: Bucket) -> u64 {
    lots.iter().map(|lot| u64::from(bucket.of(lot))).sum()
}

/// Plans taking `quantity` units from `bucket`, draining each lot before the next.
///
/// `lots` must already be in FIFO order. Lots that hold nothing in `bucket` are
/// skipped, so the plan only names lots that actually change.
pub fn plan_fifo(
    lots: &[InventoryLot],
    quantity: u32,
    bucket: Bucket,
) -> Result<Vec<Allocation>, Shortfall> {
    let held = total(lots, bucket);
    if u64::from(quantity) > held {
        return Err(Shortfall {
            requested: u64::from(quantity),
            held,
        });
    }

    let mut remaining = quantity;
    let mut plan = Vec::new();
    for (lot_index, lot) in lots.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(bucket.of(lot));
        if take > 0 {
            plan.push(Allocation {
                lot_index,
                quantity: take,
            });
            remaining -= take;
        }
    }
    Ok(plan)
}

/// New available quantities that make the total available equal `target`.
///
/// A raise is added to the newest lot. A cut is taken from the oldest lots first,
/// the same order in which reservations consume them. Reserved and sold units
/// are never touched. Returns `(lot_index, new_available)` for changed lots only.
pub fn plan_absolute(lots: &[InventoryLot], target: u32) -> Vec<(usize, u32)> {
    let current = total(lots, Bucket::Available);
    let target_total = u64::from(target);

    match target_total.cmp(&current) {
        Ordering::Equal => Vec::new(),
        Ordering::Greater => {
            let Some((index, newest)) = lots.iter().enumerate().next_back() else {
                return Vec::new();
            };
            // target - current <= u32::MAX and the result is bounded by target
            let raise = target_total - current;
            let raised = u64::from(newest.available_stock()) + raise;
            vec![(index, u32::try_from(raised).unwrap_or(u32::MAX))]
        }
        Ordering::Less => {
            let mut cut = current - target_total;
            let mut changes = Vec::new();
            for (index, lot) in lots.iter().enumerate() {
                if cut == 0 {
                    break;
                }
                let available = u64::from(lot.available_stock());
                let take = cut.min(available);
                if take > 0 {
                    let left = u32::try_from(available - take).unwrap_or(0);
                    changes.push((index, left));
                    cut -= take;
                }
            }
            changes
        }
    }
}
