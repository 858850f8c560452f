/// Matrix product `output[m, n] = a[m, k] · b[k, n]`, all row-major.
pub fn multiply(output: &mut [f32], a: &[f32], b: &[f32], m: usize, k: usize, n: usize) {
    assert_eq!(a.len(), m * k, "lhs must be [{m}, {k}]");
    assert_eq!(b.len(), k * n, "rhs must be [{k}, {n}]");
    assert_eq!(output.len(), m * n, "output must be [{m}, {n}]");

    let row = |(a, c): (&[f32], &mut [f32])| {
        c.fill(0.0);
        for (&a, b) in a.iter().zip(b.chunks_exact(n)) {
            c.iter_mut().zip(b).for_each(|(c, &b)| *c += a * b);
        }
    };

    #[cfg(not(feature = "rayon"))]
    a.chunks_exact(k).zip(output.chunks_exact_mut(n)).for_each(row);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        a.par_chunks_exact(k)
            .zip(output.par_chunks_exact_mut(n))
            .for_each(row);
    }
}

/// Writes the `[cols, rows]` transpose of the row-major `x[rows, cols]` into `output`.
pub fn transpose(output: &mut [f32], x: &[f32], rows: usize, cols: usize) {
    assert_eq!(x.len(), rows * cols, "input must be [{rows}, {cols}]");
    assert_eq!(output.len(), rows * cols, "output must be [{cols}, {rows}]");

    for (i, j) in itertools::iproduct!(0..rows, 0..cols) {
        output[j * rows + i] = x[i * cols + j];
    }
}
