//! Numeric kernels on `f32` slices.
//!
//! Every kernel is pure: it reads its inputs and only writes the output slice it is handed.
//! Matrices are row-major. With the `rayon` feature the kernels split their work across the
//! global thread pool.

pub mod cpu;

pub use cpu::{
    elementwise::{add, apply, dot, scalar_div, scalar_mul, sub},
    matmul::{multiply, transpose},
    norm::softmax,
    reduce::{average, shrink},
};
