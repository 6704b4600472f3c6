//! Vector math shared by retrieval, labeling, clustering and calibration.

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in [-1, 1].
///
/// Zero-norm inputs and mismatched lengths score 0 instead of failing.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let a_norm = l2_norm(a);
    let b_norm = l2_norm(b);
    if a_norm < f32::EPSILON || b_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot_product / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

/// Unit-length copy of `v`; zero vectors stay zero.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm < f32::EPSILON {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

/// A vector usable for similarity: non-empty, the expected length, all finite.
pub fn is_usable(v: &[f32], dim: usize) -> bool {
    !v.is_empty() && v.len() == dim && v.iter().all(|x| x.is_finite())
}

pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum()
}
