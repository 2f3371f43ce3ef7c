//! Sun position and daylight curves.
//!
//! The clock hour is first mapped to a solar fraction in `[0, 1)` where
//! sunrise lands on 0.25, sunset on 0.75 and solar noon halfway between, so
//! uneven day and night lengths still put the sun on the horizon at the
//! configured times.

use glam::Vec3;

/// Map a clock hour to the solar day fraction.
pub fn solar_fraction(hour: f64, sunrise: f64, sunset: f64) -> f64 {
    let hour = hour.rem_euclid(24.0);
    let night = 24.0 - (sunset - sunrise);
    if hour >= sunrise && hour < sunset {
        0.25 + 0.5 * (hour - sunrise) / (sunset - sunrise)
    } else {
        let since_sunset = (hour - sunset).rem_euclid(24.0);
        (0.75 + 0.5 * since_sunset / night) % 1.0
    }
}

/// Unit direction towards the sun; +Y is up, the sun travels in the XY plane.
///
/// Fraction 0.5 puts the sun overhead, 0.0 directly below.
pub fn sun_direction(solar_fraction: f64) -> Vec3 {
    let angle = (solar_fraction as f32) * std::f32::consts::TAU;
    Vec3::new(angle.sin(), -angle.cos(), 0.0).normalize()
}

/// Sun elevation above the horizon in degrees, in `[-90, 90]`.
pub fn sun_elevation_degrees(direction: Vec3) -> f32 {
    direction.y.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Direct light multiplier in `[0, 1]`, smooth through twilight.
///
/// Full light above 15° elevation, none below −10°.
pub fn sun_intensity_curve(direction: Vec3) -> f32 {
    let low = (-10.0_f32).to_radians().sin();
    let high = (15.0_f32).to_radians().sin();
    smoothstep(low, high, direction.y)
}

/// Ambient light level: 0.05 at night rising to 0.15 at full day.
pub fn ambient_intensity(direction: Vec3) -> f32 {
    let sun = sun_intensity_curve(direction);
    0.05 + (0.15 - 0.05) * sun
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}
