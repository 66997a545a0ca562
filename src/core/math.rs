//! Small linear-algebra helpers shared across the pipeline.

use nalgebra::allocator::Allocator;
use nalgebra::{Cholesky, DefaultAllocator, Dim, Matrix3, OMatrix, RealField, UnitQuaternion};

/// Skew-symmetric matrix of `v`, so that `hat(v) * u == v x u`.
pub fn hat<T: RealField + Copy>(v: &nalgebra::Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z,
        v.y,
        v.z,
        T::zero(),
        -v.x,
        -v.y,
        v.x,
        T::zero(),
    )
}

/// Upper-triangular square root `U` of a symmetric positive-definite matrix
/// `A`, with `U^T * U == A`.
///
/// Returns `None` when the Cholesky factorization fails (the matrix is not
/// positive definite); callers treat that as a degenerate input.
pub fn sqrt_info_upper<T, D>(a: OMatrix<T, D, D>) -> Option<OMatrix<T, D, D>>
where
    T: RealField,
    D: Dim,
    DefaultAllocator: Allocator<D, D>,
{
    Cholesky::new(a).map(|chol| chol.l().transpose())
}

/// Interpolate between two rigid transforms: geodesic on the rotation,
/// linear on the translation.
pub fn interp_se3(
    t0: &nalgebra::Isometry3<f32>,
    t1: &nalgebra::Isometry3<f32>,
    s: f32,
) -> nalgebra::Isometry3<f32> {
    let dr = (t0.rotation.inverse() * t1.rotation).scaled_axis();
    let rot = t0.rotation * UnitQuaternion::from_scaled_axis(dr * s);
    let pos = t0.translation.vector + (t1.translation.vector - t0.translation.vector) * s;
    nalgebra::Isometry3::from_parts(pos.into(), rot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Matrix3, Translation3, Vector3};

    #[test]
    fn test_hat_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-0.5, 4.0, 0.25);
        assert_relative_eq!(hat(&v) * u, v.cross(&u), epsilon = 1e-12);
        // Antisymmetry
        assert_relative_eq!((hat(&v) + hat(&v).transpose()).norm(), 0.0);
    }

    #[test]
    fn test_sqrt_info_upper_roundtrip() {
        let a = Matrix3::new(4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0);
        let u = sqrt_info_upper(a).expect("spd");
        assert_relative_eq!(u.transpose() * u, a, epsilon = 1e-12);
        // Upper-triangular with positive diagonal
        assert_eq!(u[(1, 0)], 0.0);
        assert_eq!(u[(2, 0)], 0.0);
        assert_eq!(u[(2, 1)], 0.0);
        for i in 0..3 {
            assert!(u[(i, i)] > 0.0);
        }
    }

    #[test]
    fn test_sqrt_info_upper_rejects_indefinite() {
        let a = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(sqrt_info_upper(a).is_none());
    }

    #[test]
    fn test_interp_se3_endpoints() {
        let t0 = Isometry3::identity();
        let t1 = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 1.0)),
        );
        let a = interp_se3(&t0, &t1, 0.0);
        let b = interp_se3(&t0, &t1, 1.0);
        assert_relative_eq!(a.translation.vector.norm(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(
            b.translation.vector,
            t1.translation.vector,
            epsilon = 1e-6
        );

        // Midpoint rotation is half the angle
        let mid = interp_se3(&t0, &t1, 0.5);
        assert_relative_eq!(mid.rotation.angle(), 0.5, epsilon = 1e-5);
    }
}
