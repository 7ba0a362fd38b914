//! Application limited region (ALR) detection.
//!
//! When the application sends well below the estimate, the feedback tells us little
//! about the link and the estimate should not be raised on it.

mod budget;
mod detector;

pub(crate) use detector::AlrDetector;
