//! Crop recommendations ranked by season, location and a pH-based water
//! proxy. Pure functions over the catalog; no state.

use serde::{Deserialize, Serialize};
use time::Month;

use crate::crops::Crop;

/// Number of crops returned when the caller does not ask for a limit.
pub const DEFAULT_LIMIT: usize = 10;

const SEASON_WEIGHT: f64 = 3.0;
const LOCATION_WEIGHT: f64 = 2.0;
const WATER_WEIGHT: f64 = 1.0;

/// pH midpoint the water proxy favours.
const WATER_IDEAL_PH: f64 = 6.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub farm_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCrop {
    #[serde(flatten)]
    pub crop: Crop,
    pub recommendation_score: f64,
}

// ---------------------------------------------------------------------------
// Component scores
// ---------------------------------------------------------------------------

/// 100 in season, 60 in an adjacent month, 30 otherwise.
pub fn seasonal_score(crop: &Crop, month: Month) -> f64 {
    let value = crop.value.to_lowercase();
    let listed = |m: Month| seasonal_crops(m).contains(&value.as_str());

    if listed(month) {
        100.0
    } else if listed(month.previous()) || listed(month.next()) {
        60.0
    } else {
        30.0
    }
}

/// 100 for the exact location, 70 for a region named inside it, 50 when no
/// location is known, 40 otherwise.
pub fn location_score(crop: &Crop, profile: &UserProfile) -> f64 {
    let location = profile
        .farm_location
        .as_deref()
        .map(|l| l.trim().to_lowercase())
        .unwrap_or_default();
    if location.is_empty() {
        return 50.0;
    }

    let value = crop.value.to_lowercase();
    if region_crops(&location).contains(&value.as_str()) {
        return 100.0;
    }

    let in_region = location
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .any(|part| region_crops(part).contains(&value.as_str()));
    if in_region {
        70.0
    } else {
        40.0
    }
}

/// Rainfall stand-in: crops whose pH midpoint sits near 6.5 score higher.
pub fn water_score(crop: &Crop) -> f64 {
    let deviation = (crop.midpoint_ph() - WATER_IDEAL_PH).abs();
    (100.0 - deviation * 10.0).clamp(30.0, 100.0)
}

pub fn score(crop: &Crop, profile: &UserProfile, month: Month) -> f64 {
    SEASON_WEIGHT * seasonal_score(crop, month)
        + LOCATION_WEIGHT * location_score(crop, profile)
        + WATER_WEIGHT * water_score(crop)
}

/// Rank the catalog by composite score, highest first. Ties keep catalog
/// order.
pub fn recommend(
    profile: &UserProfile,
    catalog: &[Crop],
    month: Month,
    limit: usize,
) -> Vec<ScoredCrop> {
    let mut scored: Vec<ScoredCrop> = catalog
        .iter()
        .map(|crop| ScoredCrop {
            crop: crop.clone(),
            recommendation_score: score(crop, profile, month),
        })
        .collect();

    // sort_by is stable
    scored.sort_by(|a, b| b.recommendation_score.total_cmp(&a.recommendation_score));
    scored.truncate(limit);
    scored
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

fn seasonal_crops(month: Month) -> &'static [&'static str] {
    match month {
        Month::January => &[
            "wheat", "barley", "rye", "peas", "carrot", "radish", "turnip", "spinach",
            "lettuce", "mustard", "cabbage", "cauliflower", "broccoli",
        ],
        Month::February => &[
            "wheat", "barley", "rye", "peas", "carrot", "radish", "spinach", "lettuce",
            "mustard", "cabbage",
        ],
        Month::March => &[
            "chickpea", "moong", "urad", "barley", "wheat", "tomato", "cucumber", "squash",
            "okra", "pepper",
        ],
        Month::April => &[
            "rice", "maize", "cotton", "sugarcane", "tomato", "onion", "garlic", "chili",
            "eggplant",
        ],
        Month::May => &[
            "rice", "maize", "cotton", "sugarcane", "millet", "sorghum", "pigeon_pea",
            "arhar",
        ],
        Month::June => &[
            "rice", "maize", "cotton", "sugarcane", "millet", "sorghum", "pigeon_pea",
        ],
        Month::July => &[
            "rice", "maize", "cotton", "sugarcane", "millet", "okra", "bottle_gourd",
            "bitter_melon",
        ],
        Month::August => &[
            "rice", "maize", "cotton", "millet", "sorghum", "okra", "bottle_gourd",
            "bitter_melon",
        ],
        Month::September => &[
            "rice", "maize", "millet", "sorghum", "chickpea", "lentil", "moong", "tomato",
        ],
        Month::October => &[
            "wheat", "barley", "rye", "chickpea", "lentil", "carrot", "radish", "spinach",
            "lettuce", "cabbage",
        ],
        Month::November => &[
            "wheat", "barley", "chickpea", "lentil", "peas", "carrot", "radish", "spinach",
            "lettuce", "mustard",
        ],
        Month::December => &[
            "wheat", "barley", "rye", "peas", "carrot", "radish", "spinach", "lettuce",
            "mustard", "cabbage",
        ],
    }
}

fn region_crops(region: &str) -> &'static [&'static str] {
    match region {
        // Northern states
        "punjab" => &["wheat", "rice", "cotton", "sugarcane", "maize"],
        "haryana" => &["wheat", "rice", "cotton", "maize", "mustard"],
        "uttar pradesh" => &["wheat", "rice", "sugarcane", "chickpea", "lentil"],
        "himachal pradesh" => &["apple", "mango", "wheat", "rice", "potato"],
        "jammu" => &["rice", "maize", "wheat", "apple", "walnut"],
        "kashmir" => &["rice", "maize", "apple", "walnut", "saffron"],
        // Central states
        "madhya pradesh" => &["wheat", "soybean", "cotton", "chickpea", "lentil"],
        "chhattisgarh" => &["rice", "cotton", "chickpea", "lentil"],
        // Eastern states
        "bihar" => &["rice", "wheat", "maize", "lentil", "chickpea"],
        "west bengal" => &["rice", "jute", "wheat", "maize", "potato"],
        "odisha" => &["rice", "lentil", "groundnut", "cotton"],
        "jharkhand" => &["rice", "wheat", "maize", "cotton", "lentil"],
        // Southern states
        "tamil nadu" => &["rice", "sugarcane", "groundnut", "cotton", "mango", "banana"],
        "karnataka" => &["rice", "sugarcane", "cotton", "groundnut", "coffee"],
        "telangana" => &["rice", "groundnut", "cotton", "sugarcane", "turmeric"],
        "andhra pradesh" => &["rice", "cotton", "groundnut", "sugarcane", "chili"],
        "kerala" => &["coconut", "banana", "pepper", "tea", "coffee"],
        // Western states
        "maharashtra" => &["sugarcane", "cotton", "groundnut", "soybean", "chickpea"],
        "gujarat" => &["cotton", "groundnut", "tobacco", "sugarcane", "wheat"],
        "rajasthan" => &["wheat", "barley", "mustard", "groundnut", "millet"],
        "goa" => &["coconut", "arecanut", "banana", "rice"],
        _ => &[],
    }
}

// ===========================================================================
// Tests
// ===========================================================================
