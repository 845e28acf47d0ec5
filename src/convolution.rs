// convolution.rs -- Separable convolution used for image pre-filtering.
//
// Each round blurs both images with a Gaussian before correlation to
// suppress sensor noise. A 2D Gaussian is separable, so the filter is two
// 1D passes (rows, then columns): O(2k) per pixel instead of O(k²).
//
// BORDER HANDLING: clamp (replicate edge pixels), the same policy the
// interpolators in image.rs use.
//
// Rows of the output are independent, so both passes run row-parallel on
// the rayon global pool.

use rayon::prelude::*;

use crate::image::{Image, Pixel};

fn check_kernel(kernel: &[f32]) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
}

/// Convolve each row of `src` with a centered 1D kernel (horizontal pass).
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    check_kernel(kernel);
    let (w, h) = (src.width(), src.height());
    if w == 0 || h == 0 {
        return Image::new(w, h);
    }
    let half = kernel.len() as isize / 2;
    let last = w as isize - 1;

    let data: Vec<f32> = (0..h)
        .into_par_iter()
        .flat_map_iter(|y| {
            let row = src.row(y);
            (0..w).map(move |x| {
                kernel
                    .iter()
                    .enumerate()
                    .map(|(ki, &kv)| {
                        let sx = (x as isize + ki as isize - half).clamp(0, last) as usize;
                        row[sx].to_f32() * kv
                    })
                    .sum::<f32>()
            })
        })
        .collect();
    Image::from_vec(w, h, data)
}

/// Convolve each column of `src` with a centered 1D kernel (vertical pass).
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    check_kernel(kernel);
    let (w, h) = (src.width(), src.height());
    if w == 0 || h == 0 {
        return Image::new(w, h);
    }
    let half = kernel.len() as isize / 2;
    let last = h as isize - 1;

    let data: Vec<f32> = (0..h)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut acc = vec![0.0f32; w];
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - half).clamp(0, last) as usize;
                for (a, &p) in acc.iter_mut().zip(src.row(sy)) {
                    *a += p * kv;
                }
            }
            acc
        })
        .collect();
    Image::from_vec(w, h, data)
}

/// Full separable 2D convolution: horizontal pass then vertical pass.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// Normalized 1D Gaussian kernel of length `2 * half_size + 1`.
///
/// # Examples
/// ```
/// let k = dicer::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..2 * half_size + 1)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Isotropic Gaussian blur.
pub fn gaussian_filter<T: Pixel>(src: &Image<T>, half_size: usize, sigma: f32) -> Image<f32> {
    let k = gaussian_kernel_1d(half_size, sigma);
    convolve_separable(src, &k, &k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_kernel_properties() {
        let k = gaussian_kernel_1d(2, 1.0);
        assert_eq!(k.len(), 5);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((k[0] - k[4]).abs() < 1e-6);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn test_identity_kernel() {
        let img = Image::from_vec(4, 3, (0..12u8).collect());
        let kernel = [0.0, 0.0, 1.0, 0.0, 0.0];
        let out = convolve_separable(&img, &kernel, &kernel);
        for (x, y, v) in out.pixels() {
            assert!((v - img.get(x, y).to_f32()).abs() < 1e-6, "({x}, {y})");
        }
    }

    #[test]
    fn test_box_filter_3x3() {
        let img = Image::from_vec(3, 3, vec![0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 0.0]);
        let k = [1.0 / 3.0; 3];
        let out = convolve_separable(&img, &k, &k);
        assert!((out.get(1, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_border() {
        // x=0 replicates pixel 0: 0.25*10 + 0.5*10 + 0.25*20 = 12.5
        let img = Image::from_vec(3, 1, vec![10.0f32, 20.0, 30.0]);
        let out = convolve_rows(&img, &[0.25, 0.5, 0.25]);
        assert!((out.get(0, 0) - 12.5).abs() < 1e-6);
        assert!((out.get(2, 0) - 27.5).abs() < 1e-6);
    }

    #[test]
    fn test_cols_clamp_border() {
        let img = Image::from_vec(1, 3, vec![10.0f32, 20.0, 30.0]);
        let out = convolve_cols(&img, &[0.25, 0.5, 0.25]);
        assert!((out.get(0, 0) - 12.5).abs() < 1e-6);
        assert!((out.get(0, 1) - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_pixel() {
        let img = Image::from_vec(1, 1, vec![42.0f32]);
        let out = gaussian_filter(&img, 2, 1.0);
        assert!((out.get(0, 0) - 42.0).abs() < 1e-4);
    }

    #[test]
    #[should_panic(expected = "odd")]
    fn test_even_kernel_panics() {
        let img = Image::from_vec(4, 4, vec![0.0f32; 16]);
        convolve_rows(&img, &[0.5, 0.5]);
    }
}
