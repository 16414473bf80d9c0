//! Sensor-to-color mapping.
//!
//! Maps a filtered sensor value onto the hue wheel using the range observed
//! by the [`SampleFilter`](crate::domain::filter::SampleFilter), then converts
//! the fully saturated hue to RGB. Brightness is never derived from the hue;
//! callers attach the last commanded brightness themselves.

use crate::domain::models::{Color, SensorRange};
use palette::{FromColor, Hsv, Srgb};
use tracing::{debug, trace};

/// Degrees on the hue wheel
pub const HUE_RANGE: i32 = 360;

/// Linearly rescale `value` from `[in_min, in_max]` to `[out_min, out_max]`
/// using integer arithmetic. A flat input range maps to `out_min`.
pub fn map_value_to_range(value: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    let input_range = (in_max - in_min) as i64;
    if input_range == 0 {
        return out_min;
    }
    let output_range = (out_max - out_min) as i64;
    ((value - in_min) as i64 * output_range / input_range) as i32 + out_min
}

/// Hue in degrees for a filtered value within the observed range.
/// A flat range has no spread to map across and pins the hue to 0.
pub fn hue_for(filtered: i32, range: SensorRange) -> i32 {
    if range.is_flat() {
        return 0;
    }
    map_value_to_range(filtered, range.min, range.max, 0, HUE_RANGE)
}

/// Fully saturated, full value HSV color converted to RGB (brightness 0).
pub fn hue_to_rgb(hue: i32) -> Color {
    // 360 wraps back to red; anything outside the wheel is treated as 0.
    let hue = if (0..HUE_RANGE).contains(&hue) { hue } else { 0 };
    let rgb: Srgb<u8> = Srgb::from_color(Hsv::new(hue as f32, 1.0, 1.0)).into_format();
    Color::new(rgb.red, rgb.green, rgb.blue, 0)
}

/// Map a filtered reading to a color.
///
/// A zero raw reading yields [`Color::OFF`]: the sensor reports zeros
/// before it has warmed up.
pub fn map(filtered: i32, range: SensorRange, raw_value_for_zero_check: i32) -> Color {
    if raw_value_for_zero_check == 0 {
        debug!("Attempted to map null sensor value to color");
        return Color::OFF;
    }

    let hue = hue_for(filtered, range);
    trace!("hue value: {}", hue);
    hue_to_rgb(hue)
}
