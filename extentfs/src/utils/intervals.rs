use std::cmp::{max, min};

/// A set of disjoint half-open ranges, kept sorted by start.
///
/// Starts as one range and shrinks as pieces are carved out of it. The extent
/// population path uses it to find the parts of a request that are neither
/// resident nor already being fetched.
#[derive(Debug, Clone)]
pub(crate) struct Intervals<T: Copy + Ord>(Vec<(T, T)>);

impl<T: Copy + Ord> Intervals<T> {
    pub(crate) fn new(l: T, r: T) -> Self {
        debug_assert!(l <= r, "invalid interval: left must be <= right");
        if l < r {
            Intervals(vec![(l, r)])
        } else {
            Intervals(Vec::new())
        }
    }

    /// Removes `[slice_l, slice_r)` and returns the pieces that were removed.
    pub(crate) fn cut(&mut self, slice_l: T, slice_r: T) -> Vec<(T, T)> {
        let mut remaining = Vec::with_capacity(self.0.len() + 1);
        let mut cut = Vec::new();

        for &(l, r) in &self.0 {
            if r <= slice_l || l >= slice_r {
                remaining.push((l, r));
                continue;
            }

            let cut_l = max(l, slice_l);
            let cut_r = min(r, slice_r);
            if cut_l < cut_r {
                cut.push((cut_l, cut_r));
            }
            if l < cut_l {
                remaining.push((l, cut_l));
            }
            if cut_r < r {
                remaining.push((cut_r, r));
            }
        }

        if !cut.is_empty() {
            self.0 = remaining;
        }
        cut
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn collect(self) -> Vec<(T, T)> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_splits_and_keeps_order() {
        let mut iv = Intervals::new(0u64, 100);
        assert_eq!(iv.cut(20, 30), vec![(20, 30)]);
        assert_eq!(iv.cut(50, 200), vec![(50, 100)]);
        assert_eq!(iv.cut(60, 70), Vec::<(u64, u64)>::new());
        assert_eq!(iv.collect(), vec![(0, 20), (30, 50)]);
    }

    #[test]
    fn test_empty_interval() {
        let mut iv = Intervals::new(5u64, 5);
        assert!(iv.is_empty());
        assert!(iv.cut(0, 10).is_empty());
    }
}
