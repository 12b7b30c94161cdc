pub mod metrics;
pub mod validation;

/// Slope of leaky ReLU for non-positive inputs
pub const LEAKY_SLOPE: f32 = 0.01;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product = dot(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Scales `vector` to unit length. Returns false and leaves it untouched when
/// its norm is below `min_norm`.
pub fn normalize_vector(vector: &mut [f32], min_norm: f32) -> bool {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > min_norm {
        for x in vector.iter_mut() {
            *x /= norm;
        }
        true
    } else {
        false
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

pub fn leaky_relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        LEAKY_SLOPE * x
    }
}

pub fn leaky_relu_derivative(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        LEAKY_SLOPE
    }
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max_score = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_scores: Vec<f32> = scores.iter().map(|&x| (x - max_score).exp()).collect();
    let sum_exp: f32 = exp_scores.iter().sum();

    if sum_exp > 0.0 {
        exp_scores.iter().map(|&x| x / sum_exp).collect()
    } else {
        vec![1.0 / scores.len() as f32; scores.len()]
    }
}

/// `ln(sum(exp(scores)))` shifted by the row maximum
pub fn log_sum_exp(scores: &[f32]) -> f32 {
    let max_score = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max_score.is_finite() {
        return max_score;
    }
    let sum_exp: f32 = scores.iter().map(|&x| (x - max_score).exp()).sum();
    max_score + sum_exp.ln()
}

pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Population standard deviation
pub fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32;
    variance.sqrt()
}
