pub mod detector;
pub mod vision;
pub mod extraction;
pub mod calibration;
pub mod validation;
pub mod processor; // Two-page document orchestrator
