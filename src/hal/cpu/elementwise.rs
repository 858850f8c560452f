/// Writes `f(x, y)` for every pair of elements into `output`.
#[inline]
fn zip_map<F>(output: &mut [f32], x: &[f32], y: &[f32], f: F)
where
    F: Fn(f32, f32) -> f32 + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;

        output
            .iter_mut()
            .zip_eq(x.iter().zip_eq(y.iter()))
            .for_each(|(z, (&x, &y))| *z = f(x, y));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        output
            .par_iter_mut()
            .zip_eq(x.par_iter().zip_eq(y.par_iter()))
            .for_each(|(z, (&x, &y))| *z = f(x, y));
    }
}

/// Element-wise `output = x + y`.
pub fn add(output: &mut [f32], x: &[f32], y: &[f32]) {
    zip_map(output, x, y, |x, y| x + y)
}

/// Element-wise `output = x - y`.
pub fn sub(output: &mut [f32], x: &[f32], y: &[f32]) {
    zip_map(output, x, y, |x, y| x - y)
}

/// Element-wise (Hadamard) product `output = x ⊙ y`.
pub fn dot(output: &mut [f32], x: &[f32], y: &[f32]) {
    zip_map(output, x, y, |x, y| x * y)
}

/// Writes `f(x)` for every element into `output`.
pub fn apply<F>(output: &mut [f32], x: &[f32], f: F)
where
    F: Fn(f32) -> f32 + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;

        output
            .iter_mut()
            .zip_eq(x.iter())
            .for_each(|(z, &x)| *z = f(x));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        output
            .par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(z, &x)| *z = f(x));
    }
}

pub fn scalar_mul(output: &mut [f32], x: &[f32], scalar: f32) {
    apply(output, x, |x| x * scalar)
}

pub fn scalar_div(output: &mut [f32], x: &[f32], scalar: f32) {
    apply(output, x, |x| x / scalar)
}
