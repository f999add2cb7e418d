//! Distance attenuation

/// Gain heard at `distance` from a source audible out to `range`.
///
/// Quadratic falloff from 1 at the source to 0 at the edge of range.
pub fn attenuation(distance: f32, range: f32) -> f32 {
    if !(range > 0.0) || !(distance < range) {
        return 0.0;
    }
    let linear = 1.0 - distance.max(0.0) / range;
    (linear * linear).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_gain_at_source() {
        assert_eq!(attenuation(0.0, 64.0), 1.0);
    }

    #[test]
    fn test_silent_at_and_beyond_range() {
        assert_eq!(attenuation(64.0, 64.0), 0.0);
        assert_eq!(attenuation(500.0, 64.0), 0.0);
        assert_eq!(attenuation(1.0, 0.0), 0.0);
        assert_eq!(attenuation(f32::NAN, 64.0), 0.0);
    }

    #[test]
    fn test_quadratic_midpoint() {
        assert!((attenuation(32.0, 64.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_monotonically_non_increasing() {
        let mut previous = attenuation(0.0, 16.0);
        for step in 1..=200 {
            let gain = attenuation(step as f32 * 0.1, 16.0);
            assert!(gain <= previous, "gain rose at step {}", step);
            assert!((0.0..=1.0).contains(&gain));
            previous = gain;
        }
    }
}
