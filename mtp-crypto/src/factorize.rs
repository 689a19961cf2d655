//! Pollard-rho (Brent variant) factorization of the server's `pq`.

const BATCH: u64 = 128;
const MAX_RESTARTS: u64 = 16;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

/// One Brent run with polynomial `x² + c`; `None` if it degenerated.
fn brent(n: u64, c: u64) -> Option<u64> {
    let step = |v: u64| ((mul_mod(v, v, n) as u128 + c as u128) % n as u128) as u64;

    let mut y = (c + 1) % n;
    let mut x = y;
    let mut ys = y;
    let (mut r, mut q, mut g) = (1u64, 1u64, 1u64);

    while g == 1 {
        x = y;
        for _ in 0..r {
            y = step(y);
        }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..BATCH.min(r - k) {
                y = step(y);
                q = mul_mod(q, x.abs_diff(y), n);
            }
            g = gcd(q, n);
            k += BATCH;
        }
        r <<= 1;
        if r > 1 << 24 {
            return None;
        }
    }

    if g == n {
        // The batch overshot; walk the last stretch one step at a time.
        loop {
            ys = step(ys);
            g = gcd(x.abs_diff(ys), n);
            if g > 1 {
                break;
            }
        }
    }

    (g != n).then_some(g)
}

/// Split `pq` into `(p, q)` with `p ≤ q`.
///
/// Returns `None` for values that are not a product of two factors the
/// search can find (primes, `0`, `1`).
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 {
        return None;
    }
    if pq % 2 == 0 {
        return Some((2, pq / 2));
    }
    (1..=MAX_RESTARTS)
        .filter_map(|c| brent(pq, c))
        .map(|p| (p.min(pq / p), p.max(pq / p)))
        .next()
}
