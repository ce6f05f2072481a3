//! Canonical reference lists for fuzzy correction.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Municipalities and cities accepted by place-name fields.
pub const DEFAULT_PLACES: &[&str] = &[
    "Manila", "Quezon City", "Caloocan", "Davao City", "Cebu City",
    "Zamboanga City", "Taguig", "Antipolo", "Pasig", "Cagayan de Oro",
    "Parañaque", "Valenzuela", "Bacoor", "General Santos", "Las Piñas",
    "Makati", "Bacolod", "Muntinlupa", "San Jose del Monte", "Iloilo City",
    "Dasmariñas", "Marikina", "Mandaluyong", "San Pedro", "Calamba",
    "Tarlac City", "Baguio", "Biñan", "Lucena", "Iligan",
    "Malabon", "Mandaue", "Butuan", "Angeles", "Lapu-Lapu",
    "San Fernando", "Cainta", "Batangas City", "Navotas", "Imus",
    "Lipa", "Legazpi", "Taytay", "Naga", "Malolos",
    "San Mateo", "Puerto Princesa", "General Trias", "Cabanatuan",
    "Meycauayan", "Silang", "Santa Rosa", "Baliuag", "Rodriguez",
    "Cavite City", "Olongapo", "Mabalacat", "Tacloban", "Tagum",
    "Cabuyao", "Gapan", "Tanza", "Cotabato City", "Sorsogon City",
    "Santa Maria", "Marilao", "San Jose", "Koronadal", "Roxas City",
    "Ormoc", "Dumaguete", "Kidapawan", "Digos", "Pagadian",
    "Valencia", "San Pablo", "Tagaytay", "Malaybalay", "San Carlos",
    "Panabo", "Marawi", "Surigao City", "Tuguegarao", "Dipolog",
    "San Juan", "Pasay", "Zamboanga del Sur", "Isabela", "Calbayog",
    "Sagay", "Tabuk", "Bogo", "Tandag", "Toledo", "Borongan",
];

/// Testing facilities accepted by facility-name fields.
pub const DEFAULT_FACILITIES: &[&str] = &[
    "Research Institute for Tropical Medicine",
    "RITM",
    "San Lazaro Hospital",
    "Lung Center of the Philippines",
    "Philippine General Hospital",
    "PGH",
    "Vicente Sotto Memorial Medical Center",
    "Southern Philippines Medical Center",
    "East Avenue Medical Center",
    "Philippine Heart Center",
    "National Kidney and Transplant Institute",
    "Dr. Jose N. Rodriguez Memorial Hospital",
    "Ospital ng Maynila Medical Center",
    "Quezon City General Hospital",
    "Makati Medical Center",
    "St. Luke's Medical Center",
    "Manila Doctors Hospital",
    "Chinese General Hospital",
    "Medical City",
    "Asian Hospital and Medical Center",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalLists {
    pub places: Vec<String>,
    pub facilities: Vec<String>,
}

impl Default for CanonicalLists {
    fn default() -> Self {
        Self {
            places: DEFAULT_PLACES.iter().map(|s| s.to_string()).collect(),
            facilities: DEFAULT_FACILITIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CanonicalLists {
    /// Load from JSON. A list missing from the file keeps its built-in default.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path)?;
        let lists: Self = serde_json::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            places = lists.places.len(),
            facilities = lists.facilities.len(),
            "Canonical lists loaded"
        );
        Ok(lists)
    }
}
