use super::elementwise::{add, scalar_div};

/// Sums the rows of `x[rows, cols]` into `output[cols]`.
pub fn shrink(output: &mut [f32], x: &[f32], cols: usize) {
    assert_eq!(output.len(), cols, "output must hold one row");
    assert_eq!(x.len() % cols.max(1), 0, "input must be whole rows");

    output.fill(0.0);
    for row in x.chunks_exact(cols) {
        output.iter_mut().zip(row).for_each(|(y, &x)| *y += x);
    }
}

/// Element-wise mean of equally sized inputs. An empty input list yields zeros.
pub fn average(output: &mut [f32], inputs: &[&[f32]]) {
    output.fill(0.0);
    if inputs.is_empty() {
        return;
    }
    let mut sum = vec![0.0; output.len()];
    let mut next = vec![0.0; output.len()];
    for input in inputs {
        assert_eq!(input.len(), output.len(), "inputs must match output");
        add(&mut next, &sum, input);
        std::mem::swap(&mut sum, &mut next);
    }
    scalar_div(output, &sum, inputs.len() as f32);
}
