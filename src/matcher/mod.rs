//! Template matching over decoded screenshots: load/cache templates, find
//! the best (or all) matches of a template within a haystack image.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GenericImageView, GrayImage};
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("template not found: {0}")]
    TemplateMissing(String),

    #[error("failed to load image {path}: {source}")]
    LoadFailure {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no match found for template {0} (best score {1:.3} below threshold {2:.3})")]
    NoMatch(String, f32, f32),
}

pub type MatcherResult<T> = Result<T, MatcherError>;

/// A located match: top-left corner, template footprint, and match score
/// in `[-1.0, 1.0]` (1.0 is a perfect match), mirroring the
/// `(x, y, w, h, score)` tuple the matching algorithm this is grounded on
/// returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub score: f32,
}

impl Match {
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Loads, caches, and matches image templates against screenshots.
///
/// Templates are cached write-once per key behind a `RwLock`: readers take
/// a read lock only long enough to clone the `Arc`, so concurrent lookups
/// for already-cached templates never block on each other.
pub struct ImageMatcher {
    templates_dir: PathBuf,
    default_threshold: f32,
    max_find_all_results: usize,
    cache: RwLock<HashMap<String, Arc<GrayImage>>>,
}

impl ImageMatcher {
    pub fn new(templates_dir: impl Into<PathBuf>, default_threshold: f32, max_find_all_results: usize) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            default_threshold,
            max_find_all_results,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Loads (and caches) a template by name, trying `.png` then `.jpg`/`.jpeg`
    /// if `name` has no extension of its own.
    pub fn load_template(&self, name: &str) -> MatcherResult<Arc<GrayImage>> {
        if let Some(cached) = self.cache.read().get(name) {
            return Ok(cached.clone());
        }

        let path = self.resolve_template_path(name)?;
        let img = image::open(&path)
            .map_err(|source| MatcherError::LoadFailure {
                path: path.clone(),
                source,
            })?
            .into_luma8();
        let img = Arc::new(img);

        self.cache.write().insert(name.to_string(), img.clone());
        Ok(img)
    }

    fn resolve_template_path(&self, name: &str) -> MatcherResult<PathBuf> {
        let direct = self.templates_dir.join(name);
        if direct.exists() {
            return Ok(direct);
        }
        for ext in ["png", "jpg", "jpeg"] {
            let candidate = self.templates_dir.join(format!("{name}.{ext}"));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(MatcherError::TemplateMissing(name.to_string()))
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Finds the best match of `template_name` within `haystack`, above
    /// `threshold` (or the matcher's configured default).
    pub fn find(
        &self,
        haystack: &GrayImage,
        template_name: &str,
        threshold: Option<f32>,
    ) -> MatcherResult<Match> {
        let template = self.load_template(template_name)?;
        let threshold = threshold.unwrap_or(self.default_threshold);

        let scores = normalized_cross_correlation(haystack, &template);
        let (best, score) = best_score(&scores)
            .ok_or_else(|| MatcherError::NoMatch(template_name.to_string(), -1.0, threshold))?;

        if score < threshold {
            return Err(MatcherError::NoMatch(template_name.to_string(), score, threshold));
        }

        Ok(Match {
            x: best.0,
            y: best.1,
            width: template.width(),
            height: template.height(),
            score,
        })
    }

    /// Finds every non-overlapping match above threshold, greedily: take
    /// the best remaining score, zero out a `width x height` window
    /// centered on it, repeat until the threshold is no longer met or
    /// `max_find_all_results` is reached.
    pub fn find_all(
        &self,
        haystack: &GrayImage,
        template_name: &str,
        threshold: Option<f32>,
    ) -> MatcherResult<Vec<Match>> {
        let template = self.load_template(template_name)?;
        let threshold = threshold.unwrap_or(self.default_threshold);
        let (tw, th) = (template.width(), template.height());

        let mut scores = normalized_cross_correlation(haystack, &template);
        let mut results = Vec::new();

        while results.len() < self.max_find_all_results {
            let Some((pos, score)) = best_score(&scores) else {
                break;
            };
            if score < threshold {
                break;
            }
            results.push(Match {
                x: pos.0,
                y: pos.1,
                width: tw,
                height: th,
                score,
            });
            suppress_window(&mut scores, pos, tw, th);
        }

        Ok(results)
    }
}

/// Zeroes a `width x height` window centered on `center`, clamped to the
/// score map's bounds. Centered (not the source algorithm's down-right
/// shifted window) so two accepted matches can never have overlapping
/// footprints.
fn suppress_window(scores: &mut ScoreMap, center: (u32, u32), width: u32, height: u32) {
    let half_w = (width / 2) as i64;
    let half_h = (height / 2) as i64;
    let cx = center.0 as i64;
    let cy = center.1 as i64;

    let x0 = (cx - half_w).max(0) as u32;
    let y0 = (cy - half_h).max(0) as u32;
    let x1 = ((cx + half_w) as u32).min(scores.width.saturating_sub(1));
    let y1 = ((cy + half_h) as u32).min(scores.height.saturating_sub(1));

    for y in y0..=y1 {
        for x in x0..=x1 {
            scores.set(x, y, f32::NEG_INFINITY);
        }
    }
}

struct ScoreMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ScoreMap {
    fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    fn set(&mut self, x: u32, y: u32, v: f32) {
        self.data[(y * self.width + x) as usize] = v;
    }
}

fn best_score(scores: &ScoreMap) -> Option<((u32, u32), f32)> {
    let mut best: Option<((u32, u32), f32)> = None;
    for y in 0..scores.height {
        for x in 0..scores.width {
            let v = scores.get(x, y);
            if v.is_finite() && best.map(|(_, b)| v > b).unwrap_or(true) {
                best = Some(((x, y), v));
            }
        }
    }
    best
}

/// Computes normalized cross-correlation of `template` against `haystack`
/// at every valid top-left offset, equivalent to `cv2.matchTemplate(...,
/// TM_CCOEFF_NORMED)`.
fn normalized_cross_correlation(haystack: &GrayImage, template: &GrayImage) -> ScoreMap {
    let (hw, hh) = haystack.dimensions();
    let (tw, th) = template.dimensions();

    if tw > hw || th > hh || tw == 0 || th == 0 {
        return ScoreMap {
            width: 1,
            height: 1,
            data: vec![f32::NEG_INFINITY],
        };
    }

    let out_w = hw - tw + 1;
    let out_h = hh - th + 1;

    let template_mean = mean(template);
    let template_centered: Vec<f32> = template
        .pixels()
        .map(|p| p.0[0] as f32 - template_mean)
        .collect();
    let template_norm = template_centered.iter().map(|v| v * v).sum::<f32>().sqrt();

    let mut data = vec![0.0f32; (out_w * out_h) as usize];

    for oy in 0..out_h {
        for ox in 0..out_w {
            let window_mean = window_mean(haystack, ox, oy, tw, th);
            let mut numerator = 0.0f32;
            let mut window_sq = 0.0f32;

            for ty in 0..th {
                for tx in 0..tw {
                    let h_val = haystack.get_pixel(ox + tx, oy + ty).0[0] as f32 - window_mean;
                    let t_val = template_centered[(ty * tw + tx) as usize];
                    numerator += h_val * t_val;
                    window_sq += h_val * h_val;
                }
            }

            let denom = window_sq.sqrt() * template_norm;
            let score = if denom > 1e-6 { numerator / denom } else { 0.0 };
            data[(oy * out_w + ox) as usize] = score;
        }
    }

    ScoreMap {
        width: out_w,
        height: out_h,
        data,
    }
}

fn mean(img: &GrayImage) -> f32 {
    let sum: u64 = img.pixels().map(|p| p.0[0] as u64).sum();
    sum as f32 / (img.width() * img.height()) as f32
}

fn window_mean(img: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f32 {
    let mut sum = 0u64;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            sum += img.get_pixel(x, y).0[0] as u64;
        }
    }
    sum as f32 / (w * h) as f32
}

/// Crops `haystack` to the rectangle `(x, y, width, height)`.
pub fn crop(haystack: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
    image::imageops::crop_imm(haystack, x, y, width, height).to_image()
}

/// Converts a decoded color image to grayscale.
pub fn grayscale(img: &image::DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// Binary-thresholds a grayscale image: pixels >= `threshold` become 255,
/// everything else 0.
pub fn threshold(img: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] >= threshold { 255 } else { 0 };
    }
    out
}

/// Maximum possible mean squared error for 8-bit grayscale imagery
/// (`255^2`) — the normalizing constant the MSE-based similarity below is
/// scaled against. The source algorithm this is ported from sums squared
/// error across 3 RGB channels before normalizing (`255^2 * 3`); since
/// every image in this matcher is single-channel grayscale, the constant
/// is scaled down to one channel so a maximally different pair still
/// bottoms out at exactly 0.0 rather than floor at ~0.67.
const MAX_MSE: f32 = 65_025.0;

/// Mean-squared-error similarity in `[0, 1]` between two equally sized
/// grayscale images (1.0 is identical), used for quick equality checks
/// e.g. "is the screen still showing the same thing".
pub fn similarity(a: &GrayImage, b: &GrayImage) -> Option<f32> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let (w, h) = a.dimensions();
    let sq_err: f64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            let diff = pa.0[0] as f64 - pb.0[0] as f64;
            diff * diff
        })
        .sum();
    let mse = sq_err / (w * h) as f64;
    let similarity = 1.0 - (mse as f32 / MAX_MSE);
    Some(similarity.clamp(0.0, 1.0))
}

/// Loads an arbitrary image (e.g. a freshly pulled screenshot) from disk
/// as grayscale.
pub fn load_image(path: &Path) -> MatcherResult<GrayImage> {
    Ok(image::open(path)
        .map_err(|source| MatcherError::LoadFailure {
            path: path.to_path_buf(),
            source,
        })?
        .into_luma8())
}
