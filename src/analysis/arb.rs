//! Arbitrary waveform shapes for the generator's volatile memory.

use crate::error::{BenchError, BenchResult};

/// Points in the default triangle cycle.
pub const DEFAULT_ARB_POINTS: usize = 1000;

/// One triangle cycle normalized to [-1, 1].
///
/// The first half ramps from -1 towards 1 (end point excluded), the second
/// half ramps from 1 back down to -1 inclusive.
pub fn triangle(points: usize) -> BenchResult<Vec<f64>> {
    if points < 2 {
        return Err(BenchError::InvalidInput(format!(
            "a triangle needs at least 2 points, got {points}"
        )));
    }
    let half = points / 2;
    let rest = points - half;
    let rising = (0..half).map(|i| -1.0 + 2.0 * i as f64 / half as f64);
    let falling = (0..rest).map(|i| {
        if rest == 1 {
            1.0
        } else {
            1.0 - 2.0 * i as f64 / (rest - 1) as f64
        }
    });
    Ok(rising.chain(falling).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_shape() {
        let wave = triangle(DEFAULT_ARB_POINTS).unwrap();
        assert_eq!(wave.len(), 1000);
        assert_eq!(wave[0], -1.0);
        assert!((wave[250] - 0.0).abs() < 1e-12);
        assert_eq!(wave[500], 1.0);
        assert_eq!(wave[999], -1.0);
        assert!(wave.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_odd_length() {
        let wave = triangle(5).unwrap();
        assert_eq!(wave, vec![-1.0, 0.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_too_short() {
        assert!(triangle(1).is_err());
    }
}
