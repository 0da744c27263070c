//! Integer pixel regions and node extents

use std::fmt;

/// An axis-aligned rectangle in working-space pixels
///
/// A region with a `u32::MAX` width or height is unbounded; [`Region::INFINITE`]
/// is the canonical unbounded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// An unbounded region
    pub const INFINITE: Region = Region {
        x: i32::MIN,
        y: i32::MIN,
        width: u32::MAX,
        height: u32::MAX,
    };

    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether this region has no upper bound in either dimension
    pub fn is_infinite(&self) -> bool {
        self.width == u32::MAX || self.height == u32::MAX
    }

    /// Whether this region covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered, saturating for unbounded regions
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Whether the given pixel lies inside this region
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x as i64 && x < self.right() && y >= self.y as i64 && y < self.bottom()
    }

    /// Builds a region from edges, clamping to the representable range
    fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        let left = left.clamp(i32::MIN as i64, i32::MAX as i64);
        let top = top.clamp(i32::MIN as i64, i32::MAX as i64);
        let width = (right - left).clamp(0, u32::MAX as i64 - 1);
        let height = (bottom - top).clamp(0, u32::MAX as i64 - 1);
        Self::new(left as i32, top as i32, width as u32, height as u32)
    }

    /// Smallest region containing both
    pub fn union(&self, other: &Region) -> Region {
        if self.is_infinite() || other.is_infinite() {
            return Region::INFINITE;
        }
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::from_edges(
            (self.x as i64).min(other.x as i64),
            (self.y as i64).min(other.y as i64),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Overlap of both regions, if any
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        if self.is_infinite() {
            return (!other.is_empty()).then_some(*other);
        }
        if other.is_infinite() {
            return (!self.is_empty()).then_some(*self);
        }
        let left = (self.x as i64).max(other.x as i64);
        let top = (self.y as i64).max(other.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (left < right && top < bottom).then(|| Self::from_edges(left, top, right, bottom))
    }

    /// Grows the region by `amount` pixels on every side
    pub fn expanded(&self, amount: u32) -> Region {
        if self.is_infinite() {
            return *self;
        }
        let amount = amount as i64;
        Self::from_edges(self.x as i64 - amount, self.y as i64 - amount, self.right() + amount, self.bottom() + amount)
    }

    /// Moves the region by the given offset
    pub fn translated(&self, dx: i32, dy: i32) -> Region {
        if self.is_infinite() {
            return *self;
        }
        Self::from_edges(self.x as i64 + dx as i64, self.y as i64 + dy as i64, self.right() + dx as i64, self.bottom() + dy as i64)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "(infinite)")
        } else {
            write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_intersection() {
        let a = Region::new(0, 0, 4, 4);
        let b = Region::new(2, 2, 4, 4);
        assert_eq!(a.union(&b), Region::new(0, 0, 6, 6));
        assert_eq!(a.intersection(&b), Some(Region::new(2, 2, 2, 2)));
        assert_eq!(a.intersection(&Region::new(10, 10, 1, 1)), None);
        assert_eq!(a.union(&Region::new(0, 0, 0, 0)), a);
    }

    #[test]
    fn test_infinite_regions() {
        let a = Region::new(-3, 5, 7, 2);
        assert!(Region::INFINITE.is_infinite());
        assert!(a.union(&Region::INFINITE).is_infinite());
        assert_eq!(Region::INFINITE.intersection(&a), Some(a));
        assert!(Region::INFINITE.expanded(4).is_infinite());
    }

    #[test]
    fn test_expand_and_translate() {
        let a = Region::new(0, 0, 4, 4);
        assert_eq!(a.expanded(2), Region::new(-2, -2, 8, 8));
        assert_eq!(a.translated(3, -1), Region::new(3, -1, 4, 4));
        assert!(a.contains(3, 3));
        assert!(!a.contains(4, 0));
    }
}
