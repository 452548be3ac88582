//! Fixed-width vector payloads
//!
//! The runtime's vector values map to plain arrays of machine integers and
//! floats. Widths follow the wire-value layout: the wider the lane count,
//! the narrower each lane.
//!
//! # Memory Layout
//!
//! All payloads are `#[repr(C)]` and 16-byte aligned so a value cell can be
//! copied as a single blittable span. Compiled hosts read these directly;
//! the alignment is part of the contract, covered by the layout tests below.
//!
//! # Equality
//!
//! Integer vectors compare exactly. Float vectors compare componentwise
//! with a single-precision-epsilon tolerance, matching scalar float
//! equality in the value model. Ordering is lexicographic for all of them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Tolerance used for float comparisons, single precision even for f64
/// lanes so wide and narrow lanes agree on what "equal" means.
pub const FLOAT_EPSILON: f64 = f32::EPSILON as f64;

macro_rules! int_vector {
    ($name:ident, $lane:ty, $lanes:expr, $doc:expr) => {
        #[doc = $doc]
        #[repr(C, align(16))]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [$lane; $lanes]);

        impl $name {
            pub const LANES: usize = $lanes;

            pub fn new(lanes: [$lane; $lanes]) -> Self {
                Self(lanes)
            }

            /// Broadcast a single lane value to every lane.
            pub fn splat(v: $lane) -> Self {
                Self([v; $lanes])
            }

            /// Lanewise wrapping addition.
            pub fn wrapping_add(self, rhs: Self) -> Self {
                let mut out = self.0;
                for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
                    *o = o.wrapping_add(*r);
                }
                Self(out)
            }

            /// Lanewise wrapping multiplication.
            pub fn wrapping_mul(self, rhs: Self) -> Self {
                let mut out = self.0;
                for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
                    *o = o.wrapping_mul(*r);
                }
                Self(out)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl From<[$lane; $lanes]> for $name {
            fn from(lanes: [$lane; $lanes]) -> Self {
                Self(lanes)
            }
        }
    };
}

int_vector!(IntVec2, i64, 2, "Two 64-bit integer lanes.");
int_vector!(IntVec3, i32, 3, "Three 32-bit integer lanes.");
int_vector!(IntVec4, i32, 4, "Four 32-bit integer lanes.");
int_vector!(IntVec8, i16, 8, "Eight 16-bit integer lanes.");
int_vector!(IntVec16, i8, 16, "Sixteen 8-bit integer lanes.");

macro_rules! float_vector {
    ($name:ident, $lane:ty, $lanes:expr, $doc:expr) => {
        #[doc = $doc]
        #[repr(C, align(16))]
        #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
        pub struct $name(pub [$lane; $lanes]);

        impl $name {
            pub const LANES: usize = $lanes;

            pub fn new(lanes: [$lane; $lanes]) -> Self {
                Self(lanes)
            }

            pub fn splat(v: $lane) -> Self {
                Self([v; $lanes])
            }

            /// Lanewise addition.
            pub fn add(self, rhs: Self) -> Self {
                let mut out = self.0;
                for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
                    *o += *r;
                }
                Self(out)
            }

            /// Lanewise multiplication.
            pub fn mul(self, rhs: Self) -> Self {
                let mut out = self.0;
                for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
                    *o *= *r;
                }
                Self(out)
            }

            /// IEEE bit patterns of every lane, used by content hashing.
            pub fn to_bits(self) -> [u64; $lanes] {
                let mut out = [0u64; $lanes];
                for (o, l) in out.iter_mut().zip(self.0.iter()) {
                    *o = (*l as f64).to_bits();
                }
                out
            }
        }

        // Componentwise epsilon equality; NaN lanes are never equal.
        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0
                    .iter()
                    .zip(other.0.iter())
                    .all(|(a, b)| ((*a as f64) - (*b as f64)).abs() <= FLOAT_EPSILON)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                if self == other {
                    return Some(Ordering::Equal);
                }
                for (a, b) in self.0.iter().zip(other.0.iter()) {
                    match a.partial_cmp(b) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(Ordering::Equal)
            }
        }

        impl From<[$lane; $lanes]> for $name {
            fn from(lanes: [$lane; $lanes]) -> Self {
                Self(lanes)
            }
        }
    };
}

float_vector!(FloatVec2, f64, 2, "Two 64-bit float lanes.");
float_vector!(FloatVec3, f32, 3, "Three 32-bit float lanes.");
float_vector!(FloatVec4, f32, 4, "Four 32-bit float lanes.");

/// Four 8-bit channels, RGBA order in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Opaque white, the conventional default.
    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::white()
    }
}

impl PartialOrd for Color {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Color {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_array().cmp(&other.to_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_vector_layout() {
        // 16-byte alignment is part of the blittable contract
        assert_eq!(align_of::<IntVec2>(), 16);
        assert_eq!(align_of::<IntVec16>(), 16);
        assert_eq!(align_of::<FloatVec2>(), 16);
        assert_eq!(align_of::<FloatVec4>(), 16);

        assert_eq!(size_of::<IntVec2>(), 16);
        assert_eq!(size_of::<IntVec16>(), 16);
        assert_eq!(size_of::<FloatVec2>(), 16);
        assert_eq!(size_of::<Color>(), 4);
    }

    #[test]
    fn test_int_vector_ordering_is_lexicographic() {
        let a = IntVec2::new([1, 9]);
        let b = IntVec2::new([2, 0]);
        assert!(a < b);
        assert_eq!(IntVec3::new([1, 2, 3]).cmp(&IntVec3::new([1, 2, 3])), Ordering::Equal);
        assert!(IntVec3::new([1, 2, 3]) < IntVec3::new([1, 2, 4]));
    }

    #[test]
    fn test_float_vector_epsilon_equality() {
        let a = FloatVec2::new([1.0, 2.0]);
        let b = FloatVec2::new([1.0 + FLOAT_EPSILON / 2.0, 2.0]);
        assert_eq!(a, b);

        let c = FloatVec2::new([1.0 + FLOAT_EPSILON * 4.0, 2.0]);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn test_float_vector_nan_never_equal() {
        let a = FloatVec3::new([f32::NAN, 0.0, 0.0]);
        assert_ne!(a, a);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let a = IntVec16::splat(i8::MAX);
        let b = IntVec16::splat(1);
        assert_eq!(a.wrapping_add(b), IntVec16::splat(i8::MIN));

        let x = IntVec2::new([3, 4]);
        let y = IntVec2::new([5, 6]);
        assert_eq!(x.wrapping_mul(y), IntVec2::new([15, 24]));
    }

    #[test]
    fn test_color_ordering() {
        assert!(Color::new(0, 0, 0, 0) < Color::new(0, 0, 0, 1));
        assert!(Color::new(1, 0, 0, 0) > Color::new(0, 255, 255, 255));
        assert_eq!(Color::default(), Color::white());
    }
}
