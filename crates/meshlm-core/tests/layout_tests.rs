// Integration tests for shapes, mesh layouts and autograd.

use meshlm_core::{DType, Dim, LayoutRules, MeshPlan, MeshShape, Shape, Tensor};
use proptest::prelude::*;

fn plan(mesh: &str, layout: &str) -> MeshPlan {
    MeshPlan::new(
        MeshShape::parse(mesh).unwrap(),
        LayoutRules::parse(layout).unwrap(),
    )
    .unwrap()
}

proptest! {
    // A mapped dimension is accepted exactly when the axis divides it.
    #[test]
    fn prop_layout_divisibility(size in 1usize..64, devices in 1usize..9) {
        let p = plan(&format!("x:{devices}"), "batch:x");
        let shape = Shape::new(vec![Dim::new("batch", size), Dim::new("embd", 3)]).unwrap();
        let result = p.validate(&shape);
        if size % devices == 0 {
            prop_assert!(result.is_ok());
            prop_assert_eq!(p.slice_shape(&shape).unwrap().size_of("batch").unwrap(), size / devices);
        } else {
            prop_assert!(result.unwrap_err().is_shape_error());
        }
    }

    // Unmapped dimensions are replicated whatever their size.
    #[test]
    fn prop_unmapped_dims_replicated(size in 1usize..64) {
        let p = plan("x:4,y:2", "heads:y");
        let shape = Shape::new(vec![Dim::new("vocab", size)]).unwrap();
        prop_assert!(p.validate(&shape).is_ok());
        prop_assert_eq!(p.split_count("vocab"), 1);
    }
}

fn finite_difference(
    f: &dyn Fn(&Tensor) -> Tensor,
    x: &[f64],
    shape: &Shape,
    i: usize,
) -> f64 {
    let eps = 1e-6;
    let mut plus = x.to_vec();
    plus[i] += eps;
    let mut minus = x.to_vec();
    minus[i] -= eps;
    let fp = f(&Tensor::new(plus, shape.clone(), DType::F64).unwrap())
        .to_scalar_f64()
        .unwrap();
    let fm = f(&Tensor::new(minus, shape.clone(), DType::F64).unwrap())
        .to_scalar_f64()
        .unwrap();
    (fp - fm) / (2.0 * eps)
}

#[test]
fn test_gradients_match_finite_differences() {
    let shape = Shape::from_pairs(&[("sequence", 3), ("embd", 2)]).unwrap();
    let data = vec![0.3, -0.2, 0.9, 0.1, -0.5, 0.4];
    let w = Tensor::new(
        vec![0.7, -1.1, 0.2, 0.5],
        Shape::from_pairs(&[("embd", 2), ("hidden", 2)]).unwrap(),
        DType::F64,
    )
    .unwrap();
    let out_shape = Shape::from_pairs(&[("sequence", 3), ("hidden", 2)]).unwrap();

    let f = |x: &Tensor| -> Tensor {
        let h = Tensor::einsum(&[x, &w], &out_shape).unwrap();
        let h = h.gelu().unwrap().cumsum("sequence", false).unwrap();
        let p = h.softmax("hidden").unwrap();
        let s = h.shift("sequence", 1).unwrap().tanh().unwrap();
        p.mul(&s).unwrap().sum_all().unwrap()
    };

    let x = Tensor::new(data.clone(), shape.clone(), DType::F64)
        .unwrap()
        .set_variable();
    let grads = f(&x).backward().unwrap();
    let g = grads.get(&x).unwrap().to_f64_vec().unwrap();
    for i in 0..data.len() {
        let fd = finite_difference(&f, &data, &shape, i);
        assert!((g[i] - fd).abs() < 1e-6, "grad[{i}] = {} vs {}", g[i], fd);
    }
}

#[test]
fn test_reduced_precision_rounds_every_op() {
    let shape = Shape::from_pairs(&[("embd", 4)]).unwrap();
    let x = Tensor::new(vec![1.0, 1.0 / 3.0, 2.0 / 3.0, 0.1], shape, DType::BF16).unwrap();
    let y = x.affine(3.0, 0.0).unwrap();
    for v in y.to_f64_vec().unwrap() {
        assert_eq!(DType::BF16.round(v), v);
    }
    let up = y.to_dtype(DType::F32).unwrap();
    assert_eq!(up.to_f64_vec().unwrap(), y.to_f64_vec().unwrap());
}
