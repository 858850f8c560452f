/// Row-wise softmax of `x[rows, cols]`, subtracting each row's maximum for stability.
pub fn softmax(output: &mut [f32], x: &[f32], cols: usize) {
    assert_eq!(output.len(), x.len(), "output must match input");

    let row = |(x, y): (&[f32], &mut [f32])| {
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        y.iter_mut().zip(x).for_each(|(y, &x)| *y = (x - max).exp());
        let sum: f32 = y.iter().sum();
        y.iter_mut().for_each(|y| *y /= sum);
    };

    #[cfg(not(feature = "rayon"))]
    x.chunks_exact(cols)
        .zip(output.chunks_exact_mut(cols))
        .for_each(row);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        x.par_chunks_exact(cols)
            .zip(output.par_chunks_exact_mut(cols))
            .for_each(row);
    }
}
