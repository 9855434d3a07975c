use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::{
    contours::{find_contours, BorderType, Contour},
    distance_transform::Norm,
    drawing::draw_polygon_mut,
    morphology,
    point::Point,
};
use tracing::{debug, warn};

use crate::config::SegmenterConfig;
use crate::errors::{Result, SeasonError};

/// Fraction of the height above the heuristic region; rows below it are used.
pub const FALLBACK_REGION_START: f64 = 0.6;

const MASK_ON: Luma<u8> = Luma([255]);

/// Outcome of lip segmentation. Both variants carry a mask of the input size.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionMask {
    Detected(GrayImage),
    Fallback { mask: GrayImage, reason: String },
}

impl RegionMask {
    pub fn mask(&self) -> &GrayImage {
        match self {
            Self::Detected(mask) | Self::Fallback { mask, .. } => mask,
        }
    }

    pub fn into_mask(self) -> GrayImage {
        match self {
            Self::Detected(mask) | Self::Fallback { mask, .. } => mask,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// First row of the lower-region heuristic.
pub fn fallback_start_row(height: u32) -> u32 {
    (f64::from(height) * FALLBACK_REGION_START) as u32
}

/// Mask covering the lower 40% of the rows across the full width.
pub fn lower_region_mask(width: u32, height: u32) -> GrayImage {
    let start = fallback_start_row(height);
    GrayImage::from_fn(width, height, |_, y| if y >= start { MASK_ON } else { Luma([0]) })
}

/// Convert a single pixel to 8-bit HSV: hue in 0..=180, saturation and value in 0..=255.
pub fn pixel_to_hsv(Rgb([r, g, b]): Rgb<u8>) -> [u8; 3] {
    let (rf, gf, bf) = (f32::from(r), f32::from(g), f32::from(b));
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let saturation = if max > 0.0 {
        (255.0 * delta / max).round()
    } else {
        0.0
    };

    let hue = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };

    [
        (hue / 2.0).round().min(180.0) as u8,
        saturation as u8,
        max as u8,
    ]
}

pub fn rgb_to_hsv(image: &RgbImage) -> RgbImage {
    let mut hsv = RgbImage::new(image.width(), image.height());
    for (src, dst) in image.pixels().zip(hsv.pixels_mut()) {
        *dst = Rgb(pixel_to_hsv(*src));
    }
    hsv
}

/// Shoelace area of a closed contour.
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice.abs() as f64 / 2.0
}

fn fill_contour(points: &[Point<i32>], width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let mut polygon = points.to_vec();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }

    if polygon.len() < 3 {
        for p in &polygon {
            mask.put_pixel(p.x as u32, p.y as u32, MASK_ON);
        }
    } else {
        draw_polygon_mut(&mut mask, &polygon, MASK_ON);
    }
    mask
}

/// Filled mask of the external contour with the largest area, if any.
/// Ties keep the first contour found.
fn largest_contour_mask(mask: &GrayImage) -> Option<GrayImage> {
    let contours: Vec<Contour<i32>> = find_contours(mask);
    let mut best: Option<(&Contour<i32>, f64)> = None;

    for contour in contours
        .iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
    {
        let area = contour_area(&contour.points);
        if best.map_or(true, |(_, best_area)| area > best_area) {
            best = Some((contour, area));
        }
    }

    best.map(|(contour, area)| {
        debug!(
            area,
            points = contour.points.len(),
            candidates = contours.len(),
            "keeping largest contour"
        );
        fill_contour(&contour.points, mask.width(), mask.height())
    })
}

/// Model-free lip segmenter: red hue thresholds, morphological cleanup and
/// largest-contour selection.
#[derive(Debug, Clone, Default)]
pub struct RegionSegmenter {
    config: SegmenterConfig,
}

impl RegionSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Threshold mask before any cleanup.
    pub fn threshold(&self, image: &RgbImage) -> GrayImage {
        let hsv = rgb_to_hsv(image);
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let Rgb(pixel) = *hsv.get_pixel(x, y);
            if self.config.ranges.iter().any(|r| r.contains(pixel)) {
                MASK_ON
            } else {
                Luma([0])
            }
        })
    }

    /// The algorithm proper. Errors here are turned into the heuristic mask by
    /// [`RegionSegmenter::segment`].
    pub fn try_segment(&self, image: &RgbImage) -> Result<GrayImage> {
        self.config.validate()?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SeasonError::validation(
                "image",
                format!("has zero area ({width}x{height})"),
            ));
        }

        let mask = self.threshold(image);
        // closing first fills holes inside the lips, opening then drops speckle
        let mask = morphology::close(&mask, Norm::LInf, self.config.kernel_radius);
        let mask = morphology::open(&mask, Norm::LInf, self.config.kernel_radius);

        Ok(largest_contour_mask(&mask).unwrap_or(mask))
    }

    pub fn segment(&self, image: &RgbImage) -> RegionMask {
        match self.try_segment(image) {
            Ok(mask) => RegionMask::Detected(mask),
            Err(err) => {
                warn!(error = %err, "lip segmentation failed, using lower-region heuristic");
                RegionMask::Fallback {
                    mask: lower_region_mask(image.width(), image.height()),
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HsvRange;

    const LIP_RED: Rgb<u8> = Rgb([200, 30, 40]);
    const GRAY: Rgb<u8> = Rgb([128, 128, 128]);

    fn paint(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
        for y in y0..y1 {
            for x in x0..x1 {
                image.put_pixel(x, y, color);
            }
        }
    }

    fn positives(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p[0] > 0).count()
    }

    #[test]
    fn test_pixel_to_hsv_reference_values() {
        assert_eq!(pixel_to_hsv(Rgb([255, 0, 0])), [0, 255, 255]);
        assert_eq!(pixel_to_hsv(Rgb([0, 0, 255])), [120, 255, 255]);
        assert_eq!(pixel_to_hsv(Rgb([0, 255, 0])), [60, 255, 255]);
        assert_eq!(pixel_to_hsv(GRAY), [0, 0, 128]);
        assert_eq!(pixel_to_hsv(Rgb([0, 0, 0])), [0, 0, 0]);
    }

    #[test]
    fn test_red_wraps_into_upper_hue_range() {
        let [h, s, v] = pixel_to_hsv(LIP_RED);
        assert!(h >= 170, "hue {h}");
        assert!(s >= 50 && v >= 50);
    }

    #[test]
    fn test_rectangle_is_recovered() {
        let mut image = RgbImage::from_pixel(100, 80, GRAY);
        paint(&mut image, 30, 40, 70, 60, LIP_RED);

        let result = RegionSegmenter::default().segment(&image);
        assert!(!result.is_fallback());
        let mask = result.mask();
        assert_eq!(mask.dimensions(), (100, 80));

        for (x, y, p) in mask.enumerate_pixels() {
            let inside = (31..69).contains(&x) && (41..59).contains(&y);
            let outside = !(29..71).contains(&x) || !(39..61).contains(&y);
            if inside {
                assert_eq!(p[0], 255, "interior pixel ({x}, {y}) missing");
            }
            if outside {
                assert_eq!(p[0], 0, "pixel ({x}, {y}) outside the rectangle set");
            }
        }
        let count = positives(mask) as i64;
        assert!((count - 40 * 20).abs() <= 2 * (40 + 20));
    }

    #[test]
    fn test_only_largest_region_is_kept() {
        let mut image = RgbImage::from_pixel(120, 120, GRAY);
        paint(&mut image, 20, 70, 90, 95, LIP_RED);
        paint(&mut image, 10, 10, 18, 18, LIP_RED);

        let mask = RegionSegmenter::default().segment(&image).into_mask();
        assert_eq!(mask.get_pixel(50, 80)[0], 255);
        assert_eq!(mask.get_pixel(14, 14)[0], 0);
    }

    #[test]
    fn test_white_image_yields_empty_mask_not_fallback() {
        let image = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let result = RegionSegmenter::default().segment(&image);
        assert!(matches!(result, RegionMask::Detected(_)));
        assert_eq!(positives(result.mask()), 0);
    }

    #[test]
    fn test_isolated_speckle_is_removed() {
        let mut image = RgbImage::from_pixel(32, 32, GRAY);
        image.put_pixel(16, 16, LIP_RED);
        let result = RegionSegmenter::default().segment(&image);
        assert!(!result.is_fallback());
        assert_eq!(positives(result.mask()), 0);
    }

    #[test]
    fn test_fault_falls_back_to_lower_region() {
        let segmenter = RegionSegmenter::new(SegmenterConfig {
            ranges: vec![HsvRange::new([10, 50, 50], [0, 255, 255])],
            kernel_radius: 1,
        });
        let image = RgbImage::from_pixel(10, 10, LIP_RED);

        let result = segmenter.segment(&image);
        assert!(result.is_fallback());
        assert_eq!(result.mask(), &lower_region_mask(10, 10));
        for (_, y, p) in result.mask().enumerate_pixels() {
            assert_eq!(p[0] == 255, y >= 6);
        }
    }

    #[test]
    fn test_zero_sized_image_falls_back() {
        let result = RegionSegmenter::default().segment(&RgbImage::new(0, 0));
        assert!(result.is_fallback());
        assert_eq!(result.mask().dimensions(), (0, 0));
    }

    #[test]
    fn test_contour_area_square() {
        let square = [
            Point::new(0, 0),
            Point::new(4, 0),
            Point::new(4, 4),
            Point::new(0, 4),
        ];
        assert_eq!(contour_area(&square), 16.0);
        assert_eq!(contour_area(&square[..2]), 0.0);
    }
}
