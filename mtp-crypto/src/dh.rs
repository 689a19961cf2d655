//! Validation of the Diffie-Hellman parameters a server hands out.
//!
//! `dh_prime` must be a 2048-bit safe prime, `g` must generate the
//! quadratic-residue subgroup the protocol expects, and every public value
//! must sit well inside `(1, p - 1)`.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::fill_random;

/// The prime production servers have always used; it skips the primality
/// test for the generators whose residue rule it satisfies.
pub const KNOWN_GOOD_PRIME: &str = "\
C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F\
48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C37\
20FD51F69458705AC68CD4FE6B6B13ABDC9746512969328454F18FAF8C595F64\
2477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4\
A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754\
FD17ED950D5965B4B9DD46582DB1178D169C6BC465B0D6FF9CA3928FEF5B9AE4\
E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F\
0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B";

const PRIME_BITS: u64 = 2048;
const MILLER_RABIN_ROUNDS: usize = 30;

/// Why a set of DH parameters was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum DhError {
    /// `dh_prime` is not exactly 2048 bits.
    PrimeLength { bits: u64 },
    /// `dh_prime` failed the primality test.
    NotPrime,
    /// `(dh_prime - 1) / 2` failed the primality test.
    NotSafePrime,
    /// `g` is outside 2..=7 or does not match `dh_prime`'s residue rule.
    BadGenerator { g: i32 },
    /// A public value (`g_a`, `g_b` or `g` itself) is out of range.
    ValueOutOfRange,
}

impl std::fmt::Display for DhError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimeLength { bits } => write!(f, "dh_prime has {bits} bits, expected {PRIME_BITS}"),
            Self::NotPrime => write!(f, "dh_prime is not prime"),
            Self::NotSafePrime => write!(f, "dh_prime is not a safe prime"),
            Self::BadGenerator { g } => write!(f, "g = {g} is not a valid generator for dh_prime"),
            Self::ValueOutOfRange => write!(f, "DH value out of range"),
        }
    }
}

impl std::error::Error for DhError {}

fn known_good_prime() -> BigUint {
    BigUint::parse_bytes(KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap_or_default()
}

/// Probabilistic primality with random witnesses.
pub fn is_probable_prime(n: &BigUint, rounds: usize) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u8);
    if *n < two {
        return false;
    }
    for small in [2u32, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let s = BigUint::from(small);
        if *n == s {
            return true;
        }
        if (n % &s).is_zero() {
            return false;
        }
    }

    let n_minus_one = n - &one;
    let shift = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> shift;

    let width = n.to_bytes_be().len();
    let span = n - 3u32;
    let mut raw = vec![0u8; width];

    'witness: for _ in 0..rounds {
        fill_random(&mut raw);
        let a = BigUint::from_bytes_be(&raw) % &span + &two;
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..shift {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Residue rule that makes `g` generate a subgroup of order `(p-1)/2`.
fn generator_matches(prime: &BigUint, g: i32) -> bool {
    let rem = |m: u32| -> u32 { (prime % m).try_into().unwrap_or(u32::MAX) };
    match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => false,
    }
}

/// Check `dh_prime` and `g` from `server_DH_inner_data`.
pub fn check_prime_and_generator(prime: &BigUint, g: i32) -> Result<(), DhError> {
    if prime.bits() != PRIME_BITS {
        return Err(DhError::PrimeLength { bits: prime.bits() });
    }
    if !generator_matches(prime, g) {
        return Err(DhError::BadGenerator { g });
    }
    if *prime == known_good_prime() && matches!(g, 3 | 4 | 5 | 7) {
        return Ok(());
    }
    if !is_probable_prime(prime, MILLER_RABIN_ROUNDS) {
        return Err(DhError::NotPrime);
    }
    let half = (prime - 1u32) >> 1;
    if !is_probable_prime(&half, MILLER_RABIN_ROUNDS) {
        return Err(DhError::NotSafePrime);
    }
    Ok(())
}

/// `1 < value < p - 1`, and at least 2^(2048-64) away from either end.
pub fn check_public_value(value: &BigUint, prime: &BigUint) -> Result<(), DhError> {
    let one = BigUint::one();
    let upper = prime - &one;
    if *value <= one || *value >= upper {
        return Err(DhError::ValueOutOfRange);
    }
    let margin = &one << (PRIME_BITS - 64);
    if *value <= margin || *value >= prime - &margin {
        return Err(DhError::ValueOutOfRange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_primes() {
        for p in [2u32, 3, 97, 7919, 1_000_003] {
            assert!(is_probable_prime(&BigUint::from(p), 10), "{p}");
        }
        for c in [1u32, 4, 561, 1_000_001, 7919 * 7907] {
            assert!(!is_probable_prime(&BigUint::from(c), 10), "{c}");
        }
    }

    #[test]
    fn known_prime_passes_with_g3() {
        let p = known_good_prime();
        assert_eq!(p.bits(), 2048);
        assert_eq!(check_prime_and_generator(&p, 3), Ok(()));
    }

    #[test]
    fn known_prime_rejects_mismatched_generator() {
        let p = known_good_prime();
        // p mod 8 == 3 for this prime, so g = 2 must be refused.
        assert_eq!(check_prime_and_generator(&p, 2), Err(DhError::BadGenerator { g: 2 }));
        assert_eq!(check_prime_and_generator(&p, 9), Err(DhError::BadGenerator { g: 9 }));
    }

    #[test]
    fn short_prime_is_refused() {
        let p = BigUint::from(23u32);
        assert_eq!(check_prime_and_generator(&p, 3), Err(DhError::PrimeLength { bits: 5 }));
    }

    #[test]
    fn even_candidate_is_refused() {
        // g = 4 passes the residue rule for any prime, so this reaches the
        // primality test.
        let p = known_good_prime() + 1u32;
        assert_eq!(check_prime_and_generator(&p, 4), Err(DhError::NotPrime));
    }

    #[test]
    fn generators_for_known_prime() {
        let p = known_good_prime();
        assert!(generator_matches(&p, 3));
        assert!(generator_matches(&p, 7));
        assert!(!generator_matches(&p, 5));
        assert!(!generator_matches(&p, 6));
    }

    #[test]
    fn public_value_bounds() {
        let p = known_good_prime();
        assert!(check_public_value(&BigUint::one(), &p).is_err());
        assert!(check_public_value(&(&p - 1u32), &p).is_err());
        assert!(check_public_value(&BigUint::from(3u32).modpow(&BigUint::from(12345u32), &p), &p).is_ok());
        assert!(check_public_value(&BigUint::from(1u32 << 20), &p).is_err());
    }
}
