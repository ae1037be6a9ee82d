//! Image Similarity Module
//!
//! Perceptual fingerprints of page captures and the distance between them.

use image::DynamicImage;
use imagehash::PerceptualHash;
use log::debug;

/// Default precision of the perceptual hash (16x16 => 256-bit fingerprint).
pub const DEFAULT_HASH_SIZE: usize = 16;

/// Default Hamming distance at or below which two captures count as the same page.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;

/// A fixed-size perceptual fingerprint of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    bits: Vec<bool>,
}

impl Fingerprint {
    /// Number of bits in the fingerprint.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Computes perceptual fingerprints and compares them.
pub struct SimilarityChecker {
    hasher: PerceptualHash,
    hash_size: usize,
    threshold: u32,
}

impl SimilarityChecker {
    /// Creates a checker producing `hash_size` x `hash_size` fingerprints.
    ///
    /// `threshold` is the maximum Hamming distance for two images to be
    /// considered similar.
    pub fn new(hash_size: usize, threshold: u32) -> Self {
        // The DCT drops its first column, so the source image must be wider
        // than the hash to yield `hash_size` columns.
        let hasher = PerceptualHash::new()
            .with_image_size(hash_size * 4, hash_size * 4)
            .with_hash_size(hash_size, hash_size);
        debug!(
            "SimilarityChecker initialized: hash_size={}, threshold={}",
            hash_size, threshold
        );
        SimilarityChecker {
            hasher,
            hash_size,
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Maximum possible distance between two fingerprints of this checker.
    pub fn max_distance(&self) -> u32 {
        (self.hash_size * self.hash_size) as u32
    }

    pub fn fingerprint(&self, image: &DynamicImage) -> Fingerprint {
        let hash = self.hasher.hash(image);
        Fingerprint { bits: hash.bits }
    }

    /// Score in `[0, 1]`; 1.0 means identical fingerprints.
    pub fn similarity_score(&self, a: &Fingerprint, b: &Fingerprint) -> f64 {
        let max = self.max_distance();
        if max == 0 {
            return 1.0;
        }
        let dist = distance(a, b).min(max);
        1.0 - dist as f64 / max as f64
    }

    pub fn is_similar(&self, a: &Fingerprint, b: &Fingerprint) -> bool {
        let dist = distance(a, b);
        let similar = dist <= self.threshold;
        debug!(
            "Image similarity check: hamming_distance={}, threshold={}, similar={}",
            dist, self.threshold, similar
        );
        similar
    }

    /// Fingerprints both images and compares them against the threshold.
    pub fn are_similar(&self, a: &DynamicImage, b: &DynamicImage) -> bool {
        self.is_similar(&self.fingerprint(a), &self.fingerprint(b))
    }
}

impl Default for SimilarityChecker {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_SIZE, DEFAULT_SIMILARITY_THRESHOLD)
    }
}

/// Hamming distance between two fingerprints.
///
/// Bits present in only one of the fingerprints count as differing.
pub fn distance(a: &Fingerprint, b: &Fingerprint) -> u32 {
    let differing = a
        .bits
        .iter()
        .zip(b.bits.iter())
        .filter(|(x, y)| x != y)
        .count();
    (differing + a.bits.len().abs_diff(b.bits.len())) as u32
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    /// Deterministic noise image; distinct seeds give unrelated pictures.
    pub(crate) fn noise_image(seed: u64) -> DynamicImage {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let buffer = ImageBuffer::from_fn(64, 64, |_, _| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = (state & 0xFF) as u8;
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(buffer)
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let checker = SimilarityChecker::default();
        let a = checker.fingerprint(&noise_image(1));
        let b = checker.fingerprint(&noise_image(1));
        assert_eq!(distance(&a, &b), 0);
        assert_eq!(checker.similarity_score(&a, &b), 1.0);
        assert!(checker.is_similar(&a, &b));
    }

    #[test]
    fn fingerprint_has_hash_size_squared_bits() {
        let checker = SimilarityChecker::new(16, 5);
        assert_eq!(checker.fingerprint(&noise_image(7)).len(), 256);
        assert_eq!(checker.max_distance(), 256);
    }

    #[test]
    fn inverted_fingerprint_scores_zero() {
        let checker = SimilarityChecker::new(8, 5);
        let a = checker.fingerprint(&noise_image(3));
        assert_eq!(a.len() as u32, checker.max_distance());
        let inverted = Fingerprint {
            bits: a.bits.iter().map(|bit| !bit).collect(),
        };
        assert_eq!(distance(&a, &inverted), 64);
        assert_eq!(checker.similarity_score(&a, &inverted), 0.0);
    }

    #[test]
    fn unrelated_images_are_not_similar() {
        let checker = SimilarityChecker::default();
        assert!(!checker.are_similar(&noise_image(1), &noise_image(2)));

        let a = checker.fingerprint(&noise_image(1));
        let b = checker.fingerprint(&noise_image(2));
        let score = checker.similarity_score(&a, &b);
        assert!((0.0..1.0).contains(&score));
        assert_eq!(distance(&a, &b), distance(&b, &a));
    }

    #[test]
    fn length_mismatch_counts_as_difference() {
        let a = Fingerprint { bits: vec![true, false] };
        let b = Fingerprint { bits: vec![true, false, true, true] };
        assert_eq!(distance(&a, &b), 2);
    }
}
