use approx::relative_eq;
use proptest::prelude::*;
use tensor_dispatch::ops::vectorized::{BYTE_LANES, LANES};
use tensor_dispatch::ops::{scalar, vectorized};

/// Lengths around one and two lane widths, plus empty.
fn lane_lengths() -> impl Strategy<Value = usize> {
    prop::sample::select(vec![0, 1, LANES - 1, LANES, LANES + 1, 2 * LANES - 1, 2 * LANES, 2 * LANES + 1])
}

fn float_pairs() -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
    lane_lengths().prop_flat_map(|n| {
        (
            prop::collection::vec(-1.0e3f32..1.0e3, n),
            prop::collection::vec(0.5f32..1.0e3, n),
        )
    })
}

proptest! {
    #[test]
    fn test_elementwise_matches_scalar((a, b) in float_pairs()) {
        type Kernel = fn(&[f32], &[f32], &mut [f32]);
        let pairs: [(Kernel, Kernel); 4] = [
            (scalar::add, vectorized::add),
            (scalar::sub, vectorized::sub),
            (scalar::mul, vectorized::mul),
            (scalar::div, vectorized::div),
        ];
        for (reference, lanes) in pairs {
            let mut expected = vec![0.0; a.len()];
            let mut actual = vec![0.0; a.len()];
            reference(&a, &b, &mut expected);
            lanes(&a, &b, &mut actual);
            prop_assert_eq!(&expected, &actual);
        }
    }

    #[test]
    fn test_float_reductions_agree((a, b) in float_pairs()) {
        let (s, v) = (scalar::sum(&a), vectorized::sum(&a));
        prop_assert!(relative_eq!(s, v, epsilon = 1e-3, max_relative = 1e-5), "sum {} vs {}", s, v);
        let (s, v) = (scalar::dot(&a, &b), vectorized::dot(&a, &b));
        prop_assert!(relative_eq!(s, v, epsilon = 1e-1, max_relative = 1e-5), "dot {} vs {}", s, v);
    }

    #[test]
    fn test_integer_sums_are_identical(
        x in lane_lengths().prop_flat_map(|n| prop::collection::vec(any::<i32>(), n))
    ) {
        prop_assert_eq!(scalar::sum_int(&x), vectorized::sum_int(&x));
        let wide: Vec<i64> = x.iter().map(|&v| i64::from(v) << 20).collect();
        prop_assert_eq!(scalar::sum_int(&wide), vectorized::sum_int(&wide));
    }

    #[test]
    fn test_boolean_reductions_agree(
        bytes in prop::sample::select(vec![0, 1, BYTE_LANES - 1, BYTE_LANES, BYTE_LANES + 1, 2 * BYTE_LANES + 3])
            .prop_flat_map(|n| prop::collection::vec(prop::sample::select(vec![0u8, 0, 0, 1, 255]), n))
    ) {
        prop_assert_eq!(scalar::all(&bytes), vectorized::all(&bytes));
        prop_assert_eq!(scalar::any(&bytes), vectorized::any(&bytes));
    }

    #[test]
    fn test_matmul_is_bit_identical(
        (m, k, n, a, b) in (0usize..10, 0usize..6, lane_lengths()).prop_flat_map(|(m, k, n)| (
            Just(m),
            Just(k),
            Just(n),
            prop::collection::vec(-10.0f64..10.0, m * k),
            prop::collection::vec(-10.0f64..10.0, k * n),
        ))
    ) {
        let mut expected = vec![f64::NAN; m * n];
        let mut actual = vec![f64::NAN; m * n];
        scalar::matmul(&a, &b, &mut expected, m, k, n);
        vectorized::matmul(&a, &b, &mut actual, m, k, n);
        prop_assert_eq!(expected, actual);
    }
}

#[test]
fn test_compensation_survives_lane_merging() {
    let mut data = vec![1.0e8f32; 4 * LANES];
    data.extend(std::iter::repeat_n(1.0f32, 4 * LANES + 3));
    data.extend(std::iter::repeat_n(-1.0e8f32, 4 * LANES));
    #[allow(clippy::cast_precision_loss)]
    let expected = (4 * LANES + 3) as f32;
    assert_eq!(scalar::sum(&data), expected);
    assert_eq!(vectorized::sum(&data), expected);
}
