use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(negative1.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold(
        (0f64, 0f64),
        |(s1, s2), (a, b, c, x, y)| (s1 + x * (a - b + c), s2 + y * (a - b + c)),
    )
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let mut result = 0f64;
    for (val1, val2) in a.iter().zip(b) {
        result = val1.mul_add(*val2, result);
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());

    izip!(x, y).for_each(|(x, y)| {
        *y = x.mul_add(a, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x.mul_add(a, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

/// Multiply the row-major `n x n` matrix `mat` with `x`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn matvec(mat: &[f64], x: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(out.len() == n);
    assert!(mat.len() == n * n);

    izip!(mat.chunks_exact(n), out).for_each(|(row, out)| {
        *out = izip!(row, x).fold(0f64, |acc, (a, b)| a.mul_add(*b, acc));
    });
}
