//! Proportional allocation of instances across weighted targets

/// Split `total` across `weights` with the largest-remainder method
///
/// The result always sums to `total`, and every share is within one unit of
/// its exact proportional value. Remainder ties go to the earlier target.
/// When every weight is zero the split is equal.
pub fn largest_remainder(total: u32, weights: &[u32]) -> Vec<u32> {
    if weights.is_empty() {
        return Vec::new();
    }

    let weight_sum: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    let (weights, weight_sum): (Vec<u64>, u64) = if weight_sum == 0 {
        (vec![1; weights.len()], weights.len() as u64)
    } else {
        (weights.iter().map(|&w| u64::from(w)).collect(), weight_sum)
    };

    let total = u64::from(total);
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (index, weight) in weights.iter().enumerate() {
        let exact = total * weight;
        shares.push(exact / weight_sum);
        remainders.push((exact % weight_sum, index));
    }

    let mut leftover = total - shares.iter().sum::<u64>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in remainders {
        if leftover == 0 {
            break;
        }
        shares[index] += 1;
        leftover -= 1;
    }

    // Each share is at most `total`, which came from a u32.
    shares.into_iter().map(|s| s as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_even_split() {
        assert_eq!(largest_remainder(6, &[1, 1, 1]), vec![2, 2, 2]);
    }

    #[test]
    fn test_remainder_goes_to_largest_fraction() {
        // 10 * 50/100 = 5, 10 * 30/100 = 3, 10 * 20/100 = 2
        assert_eq!(largest_remainder(10, &[50, 30, 20]), vec![5, 3, 2]);
        // 5 * 1/3 = 1.67 each: the first two targets win the ties
        assert_eq!(largest_remainder(5, &[1, 1, 1]), vec![2, 2, 1]);
        // 3 * 70/100 = 2.1, 3 * 30/100 = 0.9
        assert_eq!(largest_remainder(3, &[70, 30]), vec![2, 1]);
    }

    #[test]
    fn test_zero_weight_target_gets_nothing() {
        assert_eq!(largest_remainder(7, &[0, 3, 4]), vec![0, 3, 4]);
        assert_eq!(largest_remainder(1, &[0, 1]), vec![0, 1]);
    }

    #[test]
    fn test_all_zero_weights_split_equally() {
        assert_eq!(largest_remainder(4, &[0, 0]), vec![2, 2]);
    }

    #[test]
    fn test_empty_and_zero_total() {
        assert!(largest_remainder(5, &[]).is_empty());
        assert_eq!(largest_remainder(0, &[3, 1]), vec![0, 0]);
    }

    proptest! {
        #[test]
        fn prop_allocation_is_exact_and_fair(
            total in 0u32..100_000,
            weights in prop::collection::vec(0u32..10_000, 1..12),
        ) {
            let shares = largest_remainder(total, &weights);
            prop_assert_eq!(shares.len(), weights.len());
            prop_assert_eq!(shares.iter().map(|&s| u64::from(s)).sum::<u64>(), u64::from(total));

            let sum: u64 = weights.iter().map(|&w| u64::from(w)).sum();
            let (weights, sum): (Vec<u64>, u64) = if sum == 0 {
                (vec![1; weights.len()], weights.len() as u64)
            } else {
                (weights.iter().map(|&w| u64::from(w)).collect(), sum)
            };
            for (share, weight) in shares.iter().zip(&weights) {
                // |share - total * weight / sum| < 1, kept in integers
                let scaled = u64::from(*share) * sum;
                let exact = u64::from(total) * weight;
                prop_assert!(scaled + sum > exact && scaled < exact + sum);
            }
        }
    }
}
