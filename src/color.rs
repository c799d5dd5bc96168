//! CIE xy chromaticity to 8-bit RGB conversion.

/// The color gamut a device can physically reproduce, as a triangle in CIE
/// xy chromaticity space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gamut {
    pub red: (f64, f64),
    pub green: (f64, f64),
    pub blue: (f64, f64),
}

impl Gamut {
    /// The wide gamut of modern Hue color lights ("Gamut C").
    pub const HUE_C: Gamut = Gamut {
        red: (0.6915, 0.3083),
        green: (0.17, 0.7),
        blue: (0.1532, 0.0475),
    };

    /// Sign-based barycentric containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let sign = |a: (f64, f64), b: (f64, f64), p: (f64, f64)| {
            (p.0 - b.0) * (a.1 - b.1) - (a.0 - b.0) * (p.1 - b.1)
        };

        let p = (x, y);
        let d1 = sign(self.red, self.green, p);
        let d2 = sign(self.green, self.blue, p);
        let d3 = sign(self.blue, self.red, p);

        let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
        let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
        !(has_neg && has_pos)
    }

    /// Project an out-of-gamut point onto the nearest point of the triangle
    /// boundary: the closest point on each edge, globally nearest wins.
    pub fn clamp_to_gamut(&self, x: f64, y: f64) -> (f64, f64) {
        if self.contains(x, y) {
            return (x, y);
        }

        let p = (x, y);
        let candidates = [
            closest_point_on_segment(self.red, self.green, p),
            closest_point_on_segment(self.green, self.blue, p),
            closest_point_on_segment(self.blue, self.red, p),
        ];

        let mut best = candidates[0];
        let mut best_dist = distance_squared(best, p);
        for candidate in &candidates[1..] {
            let dist = distance_squared(*candidate, p);
            if dist < best_dist {
                best = *candidate;
                best_dist = dist;
            }
        }
        best
    }
}

/// Convert a CIE xy chromaticity and a luminance channel `y_lum` in [0, 1]
/// into an 8-bit RGB triple.
///
/// Out-of-gamut coordinates are projected onto the gamut boundary first, so
/// the result is always a color the device can reproduce. A zero `y`
/// coordinate yields black. The conversion is a pure function: equal inputs
/// always produce equal outputs.
pub fn xy_to_rgb(x: f64, y: f64, y_lum: f64, gamut: Gamut) -> (u8, u8, u8) {
    let (x, y) = gamut.clamp_to_gamut(x, y);
    if y <= 0.0 || y_lum <= 0.0 {
        return (0, 0, 0);
    }

    // xyY -> XYZ
    let z = 1.0 - x - y;
    let big_y = y_lum;
    let big_x = (big_y / y) * x;
    let big_z = (big_y / y) * z;

    // XYZ -> linear sRGB (D65)
    let r = big_x * 1.656492 - big_y * 0.354851 - big_z * 0.255038;
    let g = -big_x * 0.707196 + big_y * 1.655397 + big_z * 0.036152;
    let b = big_x * 0.051713 - big_y * 0.121364 + big_z * 1.011530;

    let mut r = gamma_encode(r);
    let mut g = gamma_encode(g);
    let mut b = gamma_encode(b);

    // A channel above 1.0 would clip and shift the hue; scale all three down
    // by the maximum channel instead.
    let max = r.max(g).max(b);
    if max > 1.0 {
        r /= max;
        g /= max;
        b /= max;
    }

    let to_byte = |v: f64| (v.max(0.0) * 255.0) as u8;
    (to_byte(r), to_byte(g), to_byte(b))
}

fn gamma_encode(v: f64) -> f64 {
    if v <= 0.003_130_8 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

fn closest_point_on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> (f64, f64) {
    let ab = (b.0 - a.0, b.1 - a.1);
    let ap = (p.0 - a.0, p.1 - a.1);
    let len_squared = ab.0 * ab.0 + ab.1 * ab.1;
    if len_squared == 0.0 {
        return a;
    }
    let t = ((ap.0 * ab.0 + ap.1 * ab.1) / len_squared).clamp(0.0, 1.0);
    (a.0 + t * ab.0, a.1 + t * ab.1)
}

fn distance_squared(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_is_deterministic() {
        let first = xy_to_rgb(0.3, 0.3, 1.0, Gamut::HUE_C);
        for _ in 0..10 {
            assert_eq!(xy_to_rgb(0.3, 0.3, 1.0, Gamut::HUE_C), first);
        }
    }

    #[test]
    fn test_zero_luminance_is_black() {
        assert_eq!(xy_to_rgb(0.3, 0.3, 0.0, Gamut::HUE_C), (0, 0, 0));
    }

    #[test]
    fn test_gamut_contains_interior_point() {
        assert!(Gamut::HUE_C.contains(0.3, 0.3));
        assert!(!Gamut::HUE_C.contains(0.05, 0.05));
    }

    #[test]
    fn test_out_of_gamut_point_is_projected() {
        let (x, y) = Gamut::HUE_C.clamp_to_gamut(0.05, 0.05);
        assert_ne!((x, y), (0.05, 0.05));
        // The projected point sits on the boundary; nudging it toward the
        // triangle centroid lands inside.
        let centroid = (
            (Gamut::HUE_C.red.0 + Gamut::HUE_C.green.0 + Gamut::HUE_C.blue.0) / 3.0,
            (Gamut::HUE_C.red.1 + Gamut::HUE_C.green.1 + Gamut::HUE_C.blue.1) / 3.0,
        );
        let nudged = (
            x + (centroid.0 - x) * 0.001,
            y + (centroid.1 - y) * 0.001,
        );
        assert!(Gamut::HUE_C.contains(nudged.0, nudged.1));
    }

    #[test]
    fn test_in_gamut_point_is_untouched() {
        assert_eq!(Gamut::HUE_C.clamp_to_gamut(0.3, 0.3), (0.3, 0.3));
    }

    #[test]
    fn test_no_channel_exceeds_range_for_full_luminance() {
        // Saturated primaries at full luminance exercise the scale-down path.
        for (x, y) in [
            Gamut::HUE_C.red,
            Gamut::HUE_C.green,
            Gamut::HUE_C.blue,
            (0.3, 0.3),
        ] {
            let (r, g, b) = xy_to_rgb(x, y, 1.0, Gamut::HUE_C);
            assert!(r > 0 || g > 0 || b > 0);
        }
    }
}
