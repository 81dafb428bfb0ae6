use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// Fixed-point scale used so fractional difficulties keep exact floor
/// semantics: target = ⌊2^(256+32) / ⌊diff · 2^32⌋⌋.
const SCALE_BITS: u32 = 32;

pub fn max_target() -> BigUint {
    BigUint::one() << 256u32
}

/// Target a hash must stay at or below to satisfy `difficulty`.
pub fn difficulty_to_target(difficulty: f64) -> BigUint {
    let scaled = (difficulty * (1u64 << SCALE_BITS) as f64).floor();
    let scaled = if scaled < 1.0 { BigUint::one() } else { BigUint::from(scaled as u128) };
    (BigUint::one() << (256 + SCALE_BITS)) / scaled
}

/// Difficulty a hash actually achieved, as the 2^256 / hash ratio.
pub fn hash_to_difficulty(hash: &BigUint) -> f64 {
    if hash.is_zero() {
        return f64::INFINITY;
    }
    let max = max_target().to_f64().unwrap_or(f64::MAX);
    let value = hash.to_f64().unwrap_or(f64::MAX);
    max / value
}

pub fn hash_value(hash_be: &[u8]) -> BigUint {
    BigUint::from_bytes_be(hash_be)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_difficulty_is_plain_floor_division() {
        let expected = max_target() / BigUint::from(1000u32);
        assert_eq!(difficulty_to_target(1000.0), expected);
    }

    #[test]
    fn fractional_difficulty_scales_exactly() {
        // diff 0.25 -> target = 2^258
        let expected = BigUint::one() << 258u32;
        assert_eq!(difficulty_to_target(0.25), expected);
    }

    #[test]
    fn hash_at_target_round_trips_difficulty() {
        let target = difficulty_to_target(500.0);
        let diff = hash_to_difficulty(&target);
        assert!((diff - 500.0).abs() / 500.0 < 1e-6);
    }

    #[test]
    fn smaller_hash_means_higher_difficulty() {
        let a = hash_to_difficulty(&(max_target() / BigUint::from(10u32)));
        let b = hash_to_difficulty(&(max_target() / BigUint::from(1000u32)));
        assert!(b > a);
    }
}
