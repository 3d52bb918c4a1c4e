use stepwise_cache::Value;

const BASE: u64 = 0x0000_0100_0000_01b3;

/// An order-sensitive hash of a sequence of integers.
///
/// Digests of adjacent ranges can be combined, so a range digested in pieces gives the
/// same result as digesting it in one go, while getting the pieces out of order does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Digest {
    hash: u64,
    len: u64,
}

fn mix(x: i64) -> u64 {
    let mut z = (x as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn power(mut base: u64, mut exp: u64) -> u64 {
    let mut acc: u64 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    acc
}

impl Digest {
    pub const EMPTY: Self = Self { hash: 0, len: 0 };

    pub fn push(&mut self, x: i64) {
        self.hash = self.hash.wrapping_mul(BASE).wrapping_add(mix(x));
        self.len += 1;
    }

    /// The digest of `self` followed by `next`.
    pub fn combine(self, next: Self) -> Self {
        Self {
            hash: self
                .hash
                .wrapping_mul(power(BASE, next.len))
                .wrapping_add(next.hash),
            len: self.len + next.len,
        }
    }

    pub fn to_value(self) -> Value {
        Value::tuple([Value::Int(self.hash as i64), Value::Int(self.len as i64)])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_tuple()? {
            [Value::Int(hash), Value::Int(len)] => Some(Self {
                hash: *hash as u64,
                len: *len as u64,
            }),
            _ => None,
        }
    }
}

/// The value `sum(lo, hi)` of the toy engine evaluates to, computed in one pass.
pub fn sum_digest(lo: i64, hi: i64) -> Value {
    let mut digest = Digest::EMPTY;
    for x in lo..hi {
        digest.push(x);
    }
    digest.to_value()
}
