//! Element datatypes and the type tag mapping.
//!
//! This module provides the [`Datatype`] trait, a sealed trait that maps Rust
//! primitive types to the element kind carried by every buffer.
//!
//! # Supported Types
//!
//! | Rust Type | MPI Equivalent     | Tag Value |
//! |-----------|-------------------|-----------|
//! | `f32`     | `MPI_FLOAT`       | 0         |
//! | `f64`     | `MPI_DOUBLE`      | 1         |
//! | `i32`     | `MPI_INT32_T`     | 2         |
//! | `i64`     | `MPI_INT64_T`     | 3         |
//! | `u8`      | `MPI_UINT8_T`     | 4         |
//! | `u32`     | `MPI_UINT32_T`    | 5         |
//! | `u64`     | `MPI_UINT64_T`    | 6         |

use crate::ReduceOp;

/// Internal module to seal the trait against external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Tag values matching C-side `MPCOMM_*` defines.
///
/// These discriminants must stay in sync with the `#define MPCOMM_*` values
/// in `csrc/mpcomm.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 32-bit floating point (`MPI_FLOAT`)
    F32 = 0,
    /// 64-bit floating point (`MPI_DOUBLE`)
    F64 = 1,
    /// 32-bit signed integer (`MPI_INT32_T`)
    I32 = 2,
    /// 64-bit signed integer (`MPI_INT64_T`)
    I64 = 3,
    /// 8-bit unsigned integer (`MPI_UINT8_T`)
    U8 = 4,
    /// 32-bit unsigned integer (`MPI_UINT32_T`)
    U32 = 5,
    /// 64-bit unsigned integer (`MPI_UINT64_T`)
    U64 = 6,
}

impl DatatypeTag {
    /// Decode a raw discriminant, as carried in collective headers.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => DatatypeTag::F32,
            1 => DatatypeTag::F64,
            2 => DatatypeTag::I32,
            3 => DatatypeTag::I64,
            4 => DatatypeTag::U8,
            5 => DatatypeTag::U32,
            6 => DatatypeTag::U64,
            _ => return None,
        })
    }

    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            DatatypeTag::U8 => 1,
            DatatypeTag::F32 | DatatypeTag::I32 | DatatypeTag::U32 => 4,
            DatatypeTag::F64 | DatatypeTag::I64 | DatatypeTag::U64 => 8,
        }
    }
}

/// Trait for types that can travel in a [`Buffer`](crate::Buffer).
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`].
pub trait Datatype: sealed::Sealed + Copy + Send + 'static {
    /// The datatype tag used for dispatch in both backends.
    const TAG: DatatypeTag;

    /// Combine two values under a reduction operation.
    fn combine(self, other: Self, op: ReduceOp) -> Self;

    /// Decode one element from native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;

    /// Encode one element into native-endian bytes.
    fn write_ne(self, bytes: &mut [u8]);
}

macro_rules! impl_datatype {
    (@base $ty:ty, $tag:expr, $add:expr, $mul:expr) => {
        impl sealed::Sealed for $ty {}
        impl Datatype for $ty {
            const TAG: DatatypeTag = $tag;

            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => ($add)(self, other),
                    ReduceOp::Prod => ($mul)(self, other),
                    ReduceOp::Min => if other < self { other } else { self },
                    ReduceOp::Max => if other > self { other } else { self },
                }
            }

            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }

            fn write_ne(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }
        }
    };
    ($ty:ty, $tag:expr, int) => {
        impl_datatype!(@base $ty, $tag, |a: $ty, b: $ty| a.wrapping_add(b), |a: $ty, b: $ty| a.wrapping_mul(b));
    };
    ($ty:ty, $tag:expr, float) => {
        impl_datatype!(@base $ty, $tag, |a: $ty, b: $ty| a + b, |a: $ty, b: $ty| a * b);
    };
}

impl_datatype!(f32, DatatypeTag::F32, float);
impl_datatype!(f64, DatatypeTag::F64, float);
impl_datatype!(i32, DatatypeTag::I32, int);
impl_datatype!(i64, DatatypeTag::I64, int);
impl_datatype!(u8, DatatypeTag::U8, int);
impl_datatype!(u32, DatatypeTag::U32, int);
impl_datatype!(u64, DatatypeTag::U64, int);

fn reduce_typed<T: Datatype>(acc: &mut [u8], contrib: &[u8], op: ReduceOp) {
    let width = std::mem::size_of::<T>();
    for (a, c) in acc.chunks_exact_mut(width).zip(contrib.chunks_exact(width)) {
        let value = T::read_ne(a).combine(T::read_ne(c), op);
        value.write_ne(a);
    }
}

/// Fold `contrib` into `acc` element-wise. Both slices hold raw elements of
/// kind `tag` and must have equal length; there is no alignment requirement.
pub(crate) fn reduce_bytes(tag: DatatypeTag, op: ReduceOp, acc: &mut [u8], contrib: &[u8]) {
    debug_assert_eq!(acc.len(), contrib.len());
    match tag {
        DatatypeTag::F32 => reduce_typed::<f32>(acc, contrib, op),
        DatatypeTag::F64 => reduce_typed::<f64>(acc, contrib, op),
        DatatypeTag::I32 => reduce_typed::<i32>(acc, contrib, op),
        DatatypeTag::I64 => reduce_typed::<i64>(acc, contrib, op),
        DatatypeTag::U8 => reduce_typed::<u8>(acc, contrib, op),
        DatatypeTag::U32 => reduce_typed::<u32>(acc, contrib, op),
        DatatypeTag::U64 => reduce_typed::<u64>(acc, contrib, op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_match_c_defines() {
        assert_eq!(DatatypeTag::F32 as i32, 0);
        assert_eq!(DatatypeTag::F64 as i32, 1);
        assert_eq!(DatatypeTag::I32 as i32, 2);
        assert_eq!(DatatypeTag::I64 as i32, 3);
        assert_eq!(DatatypeTag::U8 as i32, 4);
        assert_eq!(DatatypeTag::U32 as i32, 5);
        assert_eq!(DatatypeTag::U64 as i32, 6);
    }

    #[test]
    fn datatype_tags_match_rust_types() {
        assert_eq!(f32::TAG, DatatypeTag::F32);
        assert_eq!(f64::TAG, DatatypeTag::F64);
        assert_eq!(i32::TAG, DatatypeTag::I32);
        assert_eq!(i64::TAG, DatatypeTag::I64);
        assert_eq!(u8::TAG, DatatypeTag::U8);
        assert_eq!(u32::TAG, DatatypeTag::U32);
        assert_eq!(u64::TAG, DatatypeTag::U64);
    }

    #[test]
    fn from_raw_round_trips_every_tag() {
        for raw in 0..7 {
            let tag = DatatypeTag::from_raw(raw).expect("known tag");
            assert_eq!(tag as i32, raw);
        }
        assert_eq!(DatatypeTag::from_raw(7), None);
        assert_eq!(DatatypeTag::from_raw(-1), None);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(DatatypeTag::U8.size_of(), 1);
        assert_eq!(DatatypeTag::F32.size_of(), std::mem::size_of::<f32>());
        assert_eq!(DatatypeTag::I64.size_of(), std::mem::size_of::<i64>());
        assert_eq!(DatatypeTag::U64.size_of(), 8);
    }

    #[test]
    fn combine_follows_op() {
        assert_eq!(3i32.combine(4, ReduceOp::Sum), 7);
        assert_eq!(3i32.combine(4, ReduceOp::Prod), 12);
        assert_eq!(3i32.combine(-4, ReduceOp::Min), -4);
        assert_eq!(3.5f64.combine(-1.0, ReduceOp::Max), 3.5);
        assert_eq!(u8::MAX.combine(1, ReduceOp::Sum), 0);
    }

    #[test]
    fn reduce_bytes_is_elementwise() {
        let mut acc = Vec::new();
        let mut contrib = Vec::new();
        for (a, c) in [(1.0f64, 2.0f64), (-3.0, 10.0), (0.5, 0.25)] {
            acc.extend_from_slice(&a.to_ne_bytes());
            contrib.extend_from_slice(&c.to_ne_bytes());
        }
        reduce_bytes(DatatypeTag::F64, ReduceOp::Max, &mut acc, &contrib);
        let out: Vec<f64> = acc.chunks_exact(8).map(f64::read_ne).collect();
        assert_eq!(out, vec![2.0, 10.0, 0.5]);
    }

    #[test]
    fn reduce_bytes_handles_unaligned_slices() {
        let mut storage = vec![0u8; 1 + 8];
        let acc = &mut storage[1..];
        acc.copy_from_slice(&5u64.to_ne_bytes());
        reduce_bytes(DatatypeTag::U64, ReduceOp::Sum, acc, &7u64.to_ne_bytes());
        assert_eq!(u64::read_ne(acc), 12);
    }
}
