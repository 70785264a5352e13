//! Regional grid carbon intensity and avoided-CO2 arithmetic.
//!
//! Intensities are grams CO2-eq per kWh of grid electricity (IEA / Ember
//! 2023-24 benchmarks). Solar output displaces grid electricity, so
//! `kwh * intensity / 1000` is the kilograms of CO2 avoided.

/// Intensity used for locations missing from the table (gCO2/kWh).
pub const DEFAULT_GRID_INTENSITY_G_PER_KWH: f64 = 450.0;

/// Grid carbon intensity for a location key, falling back to the default.
pub fn grid_intensity_g_per_kwh(location: &str) -> f64 {
    match location.trim().to_lowercase().as_str() {
        "lagos" => 480.0,     // gas-heavy, high transmission loss
        "nairobi" => 120.0,   // geothermal / hydro
        "cape_town" => 850.0, // coal
        "london" => 180.0,
        "berlin" => 350.0,
        "paris" => 55.0, // nuclear
        "tokyo" => 450.0,
        "new_york" => 220.0,
        "dubai" => 580.0,
        "sydney" => 650.0,
        _ => DEFAULT_GRID_INTENSITY_G_PER_KWH,
    }
}

/// Kilograms of CO2 avoided by producing `kwh` of solar energy at `location`.
pub fn avoided_co2_kg(kwh: f64, location: &str) -> f64 {
    kwh * grid_intensity_g_per_kwh(location) / 1000.0
}
