//! Recipient splitting for A/B tests
//!
//! The test group is `ceil(sample% x total)` recipients, shuffled, then cut
//! into contiguous slices of `ceil(test_size / variants)` per variant (the
//! last slice may come up short). Everyone else is held back untouched until
//! the winner is selected.

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

/// Outcome of a split: per-variant recipient groups plus the held-back
/// remainder. Every input id lands in exactly one place.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    pub assignments: Vec<(Uuid, Vec<Uuid>)>,
    pub remainder: Vec<Uuid>,
}

impl SplitPlan {
    /// Total recipients across all variant groups
    pub fn test_group_size(&self) -> usize {
        self.assignments.iter().map(|(_, ids)| ids.len()).sum()
    }
}

/// Split recipients into variant test groups and a remainder
pub fn split_recipients<R: Rng + ?Sized>(
    mut recipient_ids: Vec<Uuid>,
    sample_percent: i32,
    variant_ids: &[Uuid],
    rng: &mut R,
) -> SplitPlan {
    let total = recipient_ids.len();
    let variant_count = variant_ids.len();

    if total == 0 || variant_count == 0 || sample_percent <= 0 {
        return SplitPlan {
            assignments: variant_ids.iter().map(|id| (*id, Vec::new())).collect(),
            remainder: recipient_ids,
        };
    }

    let percent = sample_percent.min(100) as usize;
    let test_size = div_ceil(total * percent, 100).min(total);
    let per_variant = div_ceil(test_size, variant_count);

    recipient_ids.shuffle(rng);

    let mut assignments = Vec::with_capacity(variant_count);
    let mut offset = 0usize;

    for variant_id in variant_ids {
        let end = (offset + per_variant).min(test_size);
        assignments.push((*variant_id, recipient_ids[offset..end].to_vec()));
        offset = end;
    }

    SplitPlan {
        assignments,
        remainder: recipient_ids[test_size..].to_vec(),
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_twenty_percent_two_variants() {
        let variants = ids(2);
        let plan = split_recipients(ids(1000), 20, &variants, &mut rng());

        // 1000 recipients, 20% sample, 2 variants: 100 per variant, 800 held back
        assert_eq!(plan.test_group_size(), 200);
        assert_eq!(plan.assignments[0].1.len(), 100);
        assert_eq!(plan.assignments[1].1.len(), 100);
        assert_eq!(plan.remainder.len(), 800);
    }

    #[test]
    fn test_every_recipient_in_exactly_one_group() {
        let recipients = ids(137);
        let variants = ids(3);
        let plan = split_recipients(recipients.clone(), 33, &variants, &mut rng());

        let mut seen: HashSet<Uuid> = HashSet::new();
        for (_, group) in &plan.assignments {
            for id in group {
                assert!(seen.insert(*id), "recipient assigned twice");
            }
        }
        for id in &plan.remainder {
            assert!(seen.insert(*id), "remainder overlaps a variant group");
        }
        assert_eq!(seen.len(), recipients.len());
    }

    #[test]
    fn test_group_sizes_respect_ceiling() {
        for (total, percent, variants) in [(1000, 20, 2), (999, 10, 3), (7, 50, 5), (250, 33, 4)] {
            let variant_ids = ids(variants);
            let plan = split_recipients(ids(total), percent, &variant_ids, &mut rng());

            let expected_test = ((total * percent as usize) + 99) / 100;
            assert!(plan.test_group_size() <= expected_test.min(total));
            assert_eq!(plan.remainder.len(), total - plan.test_group_size());
        }
    }

    #[test]
    fn test_last_variant_may_receive_fewer() {
        let variants = ids(3);
        // test_size = 10, per_variant = ceil(10/3) = 4 -> 4, 4, 2
        let plan = split_recipients(ids(100), 10, &variants, &mut rng());

        assert_eq!(plan.assignments[0].1.len(), 4);
        assert_eq!(plan.assignments[1].1.len(), 4);
        assert_eq!(plan.assignments[2].1.len(), 2);
        assert_eq!(plan.remainder.len(), 90);
    }

    #[test]
    fn test_hundred_percent_leaves_no_remainder() {
        let variants = ids(2);
        let plan = split_recipients(ids(11), 100, &variants, &mut rng());

        assert_eq!(plan.test_group_size(), 11);
        assert!(plan.remainder.is_empty());
    }

    #[test]
    fn test_zero_recipients() {
        let variants = ids(2);
        let plan = split_recipients(Vec::new(), 20, &variants, &mut rng());

        assert_eq!(plan.test_group_size(), 0);
        assert!(plan.remainder.is_empty());
        assert_eq!(plan.assignments.len(), 2);
    }

    #[test]
    fn test_shuffle_uses_rng() {
        let recipients = ids(50);
        let variants = ids(2);

        let plan_a = split_recipients(recipients.clone(), 50, &variants, &mut StdRng::seed_from_u64(1));
        let plan_b = split_recipients(recipients, 50, &variants, &mut StdRng::seed_from_u64(2));

        // Different seeds should produce different group membership
        assert_ne!(plan_a.assignments[0].1, plan_b.assignments[0].1);
    }
}
