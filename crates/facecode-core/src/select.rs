use crate::types::FaceRegion;

/// Pick the region with the largest area; ties go to the earliest region.
///
/// Returns `None` only for an empty slice.
pub fn largest_face(regions: &[FaceRegion]) -> Option<FaceRegion> {
    let mut iter = regions.iter();
    let mut best = *iter.next()?;
    for region in iter {
        // Strictly greater: an equal area never displaces an earlier region.
        if region.area() > best.area() {
            best = *region;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(left: u32, side: u32) -> FaceRegion {
        FaceRegion::new(0, left + side, side, left).unwrap()
    }

    #[test]
    fn test_empty() {
        assert_eq!(largest_face(&[]), None);
    }

    #[test]
    fn test_single_passes_through() {
        let r = square(5, 10);
        assert_eq!(largest_face(&[r]), Some(r));
    }

    #[test]
    fn test_picks_strictly_largest() {
        let regions = [square(0, 10), square(100, 40), square(200, 20)];
        assert_eq!(largest_face(&regions), Some(regions[1]));
    }

    #[test]
    fn test_tie_goes_to_first() {
        let a = FaceRegion::new(0, 20, 10, 0).unwrap(); // 20 x 10
        let b = FaceRegion::new(50, 60, 70, 50).unwrap(); // 10 x 20
        assert_eq!(a.area(), b.area());
        assert_eq!(largest_face(&[a, b]), Some(a));
        assert_eq!(largest_face(&[b, a]), Some(b));
    }
}
