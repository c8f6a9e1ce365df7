//! Reference ellipsoid and the geodetic <-> ECEF conversions built on it.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// An oblate reference ellipsoid given by its semi-major and semi-minor axes in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    pub a: f64,
    pub b: f64,
}

/// The WGS-84 ellipsoid.
pub const WGS84: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    b: 6_356_752.314_245_179,
};

impl Default for Ellipsoid {
    fn default() -> Self {
        WGS84
    }
}

impl Ellipsoid {
    pub fn flattening(&self) -> f64 {
        (self.a - self.b) / self.a
    }

    /// First eccentricity squared.
    pub fn eccentricity_squared(&self) -> f64 {
        1.0 - (self.b * self.b) / (self.a * self.a)
    }

    /// Radius of curvature in the prime vertical at the given latitude (degrees).
    pub fn prime_vertical_radius(&self, lat_deg: f64) -> f64 {
        let s = lat_deg.to_radians().sin();
        self.a / (1.0 - self.eccentricity_squared() * s * s).sqrt()
    }

    /// Radius of curvature in the meridian at the given latitude (degrees).
    pub fn meridian_radius(&self, lat_deg: f64) -> f64 {
        let e2 = self.eccentricity_squared();
        let s = lat_deg.to_radians().sin();
        self.a * (1.0 - e2) / (1.0 - e2 * s * s).powf(1.5)
    }

    /// Converts geodetic coordinates (degrees, meters) to an Earth-centered Earth-fixed point.
    pub fn geodetic_to_ecef(&self, lat_deg: f64, lon_deg: f64, height: f64) -> Vector3<f64> {
        let e2 = self.eccentricity_squared();
        let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();
        let n = self.prime_vertical_radius(lat_deg);
        Vector3::new(
            (n + height) * cos_lat * cos_lon,
            (n + height) * cos_lat * sin_lon,
            (n * (1.0 - e2) + height) * sin_lat,
        )
    }

    /// Converts an ECEF point to geodetic `(lat_deg, lon_deg, height)`.
    ///
    /// Iterates on the latitude until it changes by less than 1e-14 radians.
    pub fn ecef_to_geodetic(&self, ecef: &Vector3<f64>) -> (f64, f64, f64) {
        let e2 = self.eccentricity_squared();
        let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();
        let lon = ecef.y.atan2(ecef.x);

        if p < 1e-9 {
            // On the polar axis.
            let lat = if ecef.z >= 0.0 { 90.0 } else { -90.0 };
            return (lat, 0.0, ecef.z.abs() - self.b);
        }

        let mut lat = ecef.z.atan2(p * (1.0 - e2));
        let mut height = 0.0;
        for _ in 0..16 {
            let sin_lat = lat.sin();
            let n = self.a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            height = if lat.cos().abs() > 1e-3 {
                p / lat.cos() - n
            } else {
                ecef.z / sin_lat - n * (1.0 - e2)
            };
            let next = ecef.z.atan2(p * (1.0 - e2 * n / (n + height)));
            let converged = (next - lat).abs() < 1e-14;
            lat = next;
            if converged {
                break;
            }
        }

        (lat.to_degrees(), lon.to_degrees(), height)
    }

    /// Meters spanned by one degree of longitude (`x`) and latitude (`y`) at the given position.
    pub fn meters_per_degree(&self, lat_deg: f64, height: f64) -> Vector2<f64> {
        let to_rad = std::f64::consts::PI / 180.0;
        let lat_m = (self.meridian_radius(lat_deg) + height) * to_rad;
        let lon_m =
            (self.prime_vertical_radius(lat_deg) + height) * lat_deg.to_radians().cos() * to_rad;
        Vector2::new(lon_m, lat_m)
    }

    /// Rotation whose columns are the local north, east and down axes expressed in ECEF.
    pub fn ned_to_ecef(&self, lat_deg: f64, lon_deg: f64) -> Matrix3<f64> {
        let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
        let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();
        let north = Vector3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
        let east = Vector3::new(-sin_lon, cos_lon, 0.0);
        let down = Vector3::new(-cos_lat * cos_lon, -cos_lat * sin_lon, -sin_lat);
        Matrix3::from_columns(&[north, east, down])
    }

    /// Outward geodetic surface normal at the given latitude/longitude.
    pub fn up_vector(&self, lat_deg: f64, lon_deg: f64) -> Vector3<f64> {
        -self.ned_to_ecef(lat_deg, lon_deg).column(2).into_owned()
    }
}
