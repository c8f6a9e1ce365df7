use nalgebra::{Matrix4, Vector2, Vector4};

use super::GroundPoint;

/// Coarse bilinear mapping between image and ground fitted through four tie points.
///
/// Sensor models build one from their image corners and use it as the
/// extrapolation seed for queries outside the valid image or ground domain.
#[derive(Debug, Clone, PartialEq)]
pub struct BilinearProjection {
    lat_coeffs: Vector4<f64>,
    lon_coeffs: Vector4<f64>,
    sample_coeffs: Vector4<f64>,
    line_coeffs: Vector4<f64>,
    image_center: (f64, f64),
    ground_center: (f64, f64),
    height: f64,
}

fn design_row(x: f64, y: f64) -> [f64; 4] {
    [1.0, x, y, x * y]
}

fn center_of(points: &[(f64, f64); 4]) -> (f64, f64) {
    let x = points.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let y = points.iter().map(|p| p.1).sum::<f64>() / 4.0;
    (x, y)
}

fn centered(points: &[(f64, f64); 4], center: (f64, f64)) -> [(f64, f64); 4] {
    points.map(|p| (p.0 - center.0, p.1 - center.1))
}

fn fit(inputs: &[(f64, f64); 4], values: [f64; 4]) -> Option<Vector4<f64>> {
    let mut a = Matrix4::zeros();
    for (row, (x, y)) in inputs.iter().enumerate() {
        for (col, v) in design_row(*x, *y).iter().enumerate() {
            a[(row, col)] = *v;
        }
    }
    a.lu().solve(&Vector4::from(values))
}

fn evaluate(coeffs: &Vector4<f64>, x: f64, y: f64) -> f64 {
    let r = design_row(x, y);
    coeffs[0] * r[0] + coeffs[1] * r[1] + coeffs[2] * r[2] + coeffs[3] * r[3]
}

impl BilinearProjection {
    /// Fits the projection through four image/ground correspondences.
    ///
    /// Returns `None` if the points are degenerate (collinear or duplicated) or any
    /// ground point has NaN coordinates.
    pub fn new(image: &[Vector2<f64>; 4], ground: &[GroundPoint; 4]) -> Option<Self> {
        if ground.iter().any(|g| g.is_lat_lon_nan()) {
            return None;
        }
        let img: [(f64, f64); 4] = [
            (image[0].x, image[0].y),
            (image[1].x, image[1].y),
            (image[2].x, image[2].y),
            (image[3].x, image[3].y),
        ];
        let gnd: [(f64, f64); 4] = [
            (ground[0].lat, ground[0].lon),
            (ground[1].lat, ground[1].lon),
            (ground[2].lat, ground[2].lon),
            (ground[3].lat, ground[3].lon),
        ];
        let image_center = center_of(&img);
        let ground_center = center_of(&gnd);
        let img_local = centered(&img, image_center);
        let gnd_local = centered(&gnd, ground_center);
        let lat_coeffs = fit(&img_local, gnd.map(|g| g.0))?;
        let lon_coeffs = fit(&img_local, gnd.map(|g| g.1))?;
        let sample_coeffs = fit(&gnd_local, img.map(|p| p.0))?;
        let line_coeffs = fit(&gnd_local, img.map(|p| p.1))?;
        let height = ground.iter().map(|g| g.height).sum::<f64>() / 4.0;
        Some(Self {
            lat_coeffs,
            lon_coeffs,
            sample_coeffs,
            line_coeffs,
            image_center,
            ground_center,
            height: if height.is_finite() { height } else { 0.0 },
        })
    }

    /// Image to ground; the height is the mean height of the fit points.
    pub fn line_sample_to_world(&self, image_point: &Vector2<f64>) -> GroundPoint {
        let x = image_point.x - self.image_center.0;
        let y = image_point.y - self.image_center.1;
        GroundPoint::new(
            evaluate(&self.lat_coeffs, x, y),
            evaluate(&self.lon_coeffs, x, y),
            self.height,
        )
    }

    pub fn world_to_line_sample(&self, ground_point: &GroundPoint) -> Vector2<f64> {
        let lat = ground_point.lat - self.ground_center.0;
        let lon = ground_point.lon - self.ground_center.1;
        Vector2::new(
            evaluate(&self.sample_coeffs, lat, lon),
            evaluate(&self.line_coeffs, lat, lon),
        )
    }
}
