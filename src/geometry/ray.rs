use nalgebra::Vector3;

use super::ellipsoid::Ellipsoid;
use super::GroundPoint;

/// A ray in Earth-centered Earth-fixed coordinates with a unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EcefRay {
    pub origin: Vector3<f64>,
    pub direction: Vector3<f64>,
}

impl EcefRay {
    /// Creates a ray, normalizing `direction`.
    pub fn new(origin: Vector3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Ray starting at `from` and passing through `to`.
    pub fn through(from: Vector3<f64>, to: Vector3<f64>) -> Self {
        Self::new(from, to - from)
    }

    pub fn point_at(&self, t: f64) -> Vector3<f64> {
        self.origin + self.direction * t
    }

    /// Point on the ray (for `t >= 0`) closest to `point`.
    pub fn closest_point_to(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let t = (point - self.origin).dot(&self.direction).max(0.0);
        self.point_at(t)
    }

    /// Intersects the ray with the surface `height` meters above the ellipsoid.
    ///
    /// The first guess comes from the scaled ellipsoid `(a + h, b + h)`, which is then
    /// refined along the ray until the geodetic height matches `height` to a micrometer.
    /// Returns `None` when the ray misses the surface or points away from it.
    pub fn intersect_above_ellipsoid(
        &self,
        height: f64,
        ellipsoid: &Ellipsoid,
    ) -> Option<Vector3<f64>> {
        let a = ellipsoid.a + height;
        let b = ellipsoid.b + height;
        let (o, d) = (&self.origin, &self.direction);

        let a2 = a * a;
        let b2 = b * b;
        let qa = (d.x * d.x + d.y * d.y) / a2 + d.z * d.z / b2;
        let qb = 2.0 * ((o.x * d.x + o.y * d.y) / a2 + o.z * d.z / b2);
        let qc = (o.x * o.x + o.y * o.y) / a2 + o.z * o.z / b2 - 1.0;

        let disc = qb * qb - 4.0 * qa * qc;
        if disc < 0.0 || qa <= 0.0 {
            return None;
        }
        let sqrt_disc = disc.sqrt();
        let near = (-qb - sqrt_disc) / (2.0 * qa);
        let far = (-qb + sqrt_disc) / (2.0 * qa);
        let mut t = if near >= 0.0 {
            near
        } else if far >= 0.0 {
            far
        } else {
            return None;
        };

        for _ in 0..8 {
            let p = self.point_at(t);
            let (lat, lon, h) = ellipsoid.ecef_to_geodetic(&p);
            let dh = h - height;
            if dh.abs() < 1e-6 {
                break;
            }
            let rate = self.direction.dot(&ellipsoid.up_vector(lat, lon));
            if rate.abs() < 1e-12 {
                break;
            }
            t -= dh / rate;
        }

        Some(self.point_at(t))
    }

    /// Same as [`EcefRay::intersect_above_ellipsoid`] but returns a geodetic point.
    pub fn intersect_ground(&self, height: f64, ellipsoid: &Ellipsoid) -> Option<GroundPoint> {
        self.intersect_above_ellipsoid(height, ellipsoid)
            .map(|p| GroundPoint::from_ecef_with(&p, ellipsoid))
    }
}
