pub const EARTH_RADIUS_KM: f64 = 6371.0;

fn to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

fn to_degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

pub fn haversine_distance_km(
    latitude_1: f64,
    longitude_1: f64,
    latitude_2: f64,
    longitude_2: f64,
) -> f64 {
    let lat1_rad = to_radians(latitude_1);
    let lon1_rad = to_radians(longitude_1);
    let lat2_rad = to_radians(latitude_2);
    let lon2_rad = to_radians(longitude_2);

    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

pub fn haversine_distance_m(
    latitude_1: f64,
    longitude_1: f64,
    latitude_2: f64,
    longitude_2: f64,
) -> f64 {
    haversine_distance_km(latitude_1, longitude_1, latitude_2, longitude_2) * 1000.0
}

/// Coarse rectangular bounds around a center point, used to prefilter
/// candidates before the exact great-circle check.
pub fn bounding_box(
    latitude: f64,
    longitude: f64,
    radius_km: f64,
) -> ((f64, f64), (f64, f64)) {
    let lat_rad = to_radians(latitude);
    let lon_rad = to_radians(longitude);

    let min_lat = lat_rad - radius_km / EARTH_RADIUS_KM;
    let max_lat = lat_rad + radius_km / EARTH_RADIUS_KM;

    // Longitude bounds widen with latitude.
    let min_lon = lon_rad - radius_km / (EARTH_RADIUS_KM * lat_rad.cos());
    let max_lon = lon_rad + radius_km / (EARTH_RADIUS_KM * lat_rad.cos());

    (
        (to_degrees(min_lat), to_degrees(min_lon)),
        (to_degrees(max_lat), to_degrees(max_lon)),
    )
}

pub fn within_radius_m(
    center_lat: f64,
    center_lng: f64,
    latitude: f64,
    longitude: f64,
    radius_m: f64,
) -> bool {
    haversine_distance_m(center_lat, center_lng, latitude, longitude) <= radius_m
}

/// Snaps a coordinate to a fixed-size grid. Two coordinates closer than
/// `step_degrees` collapse to the same cell index.
pub fn quantize(coordinate: f64, step_degrees: f64) -> i64 {
    (coordinate / step_degrees).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_of_identical_points_is_zero() {
        let d = haversine_distance_m(23.993, 121.601, 23.993, 121.601);
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Hualien station to the harbor, roughly 1.3 km apart.
        let d = haversine_distance_km(23.993, 121.601, 23.987, 121.611);
        assert!(d > 1.0 && d < 1.5, "got {}", d);
    }

    #[test]
    fn bounding_box_contains_center() {
        let ((min_lat, min_lon), (max_lat, max_lon)) =
            bounding_box(23.993, 121.601, 5.0);
        assert!(min_lat < 23.993 && 23.993 < max_lat);
        assert!(min_lon < 121.601 && 121.601 < max_lon);
    }

    #[test]
    fn quantize_collapses_nearby_coordinates() {
        let step = 1e-4;
        assert_eq!(quantize(23.99301, step), quantize(23.99304, step));
        assert_ne!(quantize(23.9930, step), quantize(23.9950, step));
    }
}
