// image.rs -- Intensity images and sub-pixel sampling.
//
// Images enter the pipeline already decoded. Each round filters its two
// images once (`Image::filtered`) and afterwards they are shared read-only
// behind an `Arc` by the solver, the CPU reference kernel and the GPU
// upload path.
//
// SAMPLING:
// Correlation evaluates the deformed facet at non-integer positions in
// the second image. Two interpolators are provided and both clamp to the
// image border (edge pixels are replicated):
//
//   Bilinear   4 taps, C0 continuous
//   Bicubic    16 taps, Catmull-Rom spline, C1 continuous
//
// The WGSL kernel in shaders/correlation.wgsl implements the exact same
// formulas so CPU and GPU scores agree to float tolerance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::convolution;

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an Image.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Raw intensity as f32 (not normalized).
    fn to_f32(self) -> f32;

    /// Construct a pixel from an f32 value, clamping and rounding as needed.
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 65535.0).round() as u16
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D row-major image with runtime dimensions, generic over pixel type.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// Create a zero-initialized image.
    pub fn new(width: usize, height: usize) -> Self {
        Image { data: vec![T::default(); width * height], width, height }
    }

    /// Create an image from a row-major pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Whether (x, y) lies inside the image.
    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    /// Pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x}, {y}) out of bounds for {}x{} image",
            self.width,
            self.height
        );
        self.data[y * self.width + x]
    }

    /// Pixel value without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height);
        *self.data.get_unchecked(y * self.width + x)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x}, {y}) out of bounds for {}x{} image",
            self.width,
            self.height
        );
        self.data[y * self.width + x] = value;
    }

    /// Borrow row `y` as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Iterate `(x, y, value)` in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let w = self.width.max(1);
        self.data.iter().enumerate().map(move |(i, &v)| (i % w, i / w, v))
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Convert to an f32 image (raw intensities).
    pub fn to_f32(&self) -> Image<f32> {
        Image {
            data: self.data.iter().map(|p| p.to_f32()).collect(),
            width: self.width,
            height: self.height,
        }
    }
}

impl Image<f32> {
    /// Gaussian-filtered copy of the image.
    ///
    /// `kernel_size` is the full kernel width in pixels. Even sizes are
    /// rounded up to the next odd size; 0 and 1 return an unfiltered copy.
    /// Sigma follows the common rule `0.3 * ((k - 1) / 2 - 1) + 0.8`.
    pub fn filtered(&self, kernel_size: usize) -> Image<f32> {
        if kernel_size <= 1 {
            return self.clone();
        }
        let size = kernel_size | 1;
        let half = size / 2;
        let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
        convolution::gaussian_filter(self, half, sigma)
    }
}

impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image<{}x{}>", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Sub-pixel sampling
// ---------------------------------------------------------------------------

/// Sub-pixel interpolation scheme used when sampling the deformed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interpolation {
    Bilinear,
    #[default]
    Bicubic,
}

impl Interpolation {
    /// Numeric id substituted into the correlation shader.
    pub fn shader_id(self) -> u32 {
        match self {
            Interpolation::Bilinear => 0,
            Interpolation::Bicubic => 1,
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolation::Bilinear => write!(f, "bilinear"),
            Interpolation::Bicubic => write!(f, "bicubic"),
        }
    }
}

/// Sample `img` at (x, y) with the given interpolation.
#[inline]
pub fn sample(img: &Image<f32>, x: f32, y: f32, interpolation: Interpolation) -> f32 {
    match interpolation {
        Interpolation::Bilinear => interpolate_bilinear(img, x, y),
        Interpolation::Bicubic => interpolate_bicubic(img, x, y),
    }
}

/// Bilinear interpolation with border clamping.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    assert!(img.width() > 0 && img.height() > 0, "cannot interpolate on an empty image");

    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    // SAFETY: x0, x1 < width and y0, y1 < height after clamping.
    unsafe {
        let p00 = img.get_unchecked(x0, y0);
        let p10 = img.get_unchecked(x1, y0);
        let p01 = img.get_unchecked(x0, y1);
        let p11 = img.get_unchecked(x1, y1);
        (1.0 - fx) * (1.0 - fy) * p00
            + fx * (1.0 - fy) * p10
            + (1.0 - fx) * fy * p01
            + fx * fy * p11
    }
}

/// Catmull-Rom weights for the taps at offsets -1, 0, 1, 2 from floor(t).
#[inline]
fn catmull_rom_weights(t: f32) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

/// Bicubic (Catmull-Rom) interpolation with border clamping.
///
/// Reproduces the pixel value exactly at integer coordinates and is exact
/// for linear intensity ramps away from the border.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bicubic(img: &Image<f32>, x: f32, y: f32) -> f32 {
    assert!(img.width() > 0 && img.height() > 0, "cannot interpolate on an empty image");

    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let wx = catmull_rom_weights(x - x0);
    let wy = catmull_rom_weights(y - y0);
    let last_x = (img.width() - 1) as i64;
    let last_y = (img.height() - 1) as i64;

    let mut acc = 0.0f32;
    for (j, wyj) in wy.iter().enumerate() {
        let sy = (y0 as i64 + j as i64 - 1).clamp(0, last_y) as usize;
        let mut row_acc = 0.0f32;
        for (i, wxi) in wx.iter().enumerate() {
            let sx = (x0 as i64 + i as i64 - 1).clamp(0, last_x) as usize;
            // SAFETY: sx, sy are clamped into the image.
            row_acc += wxi * unsafe { img.get_unchecked(sx, sy) };
        }
        acc += wyj * row_acc;
    }
    acc
}
