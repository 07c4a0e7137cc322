//! helioseek - moving-object detection and linking
//!
//! A library for finding and characterizing moving solar-system objects
//! (asteroids, comets, space debris) in time-series astrometry: tracklet
//! construction within nights, heliocentric-hypothesis linking across
//! nights, linkage purification, and fully perturbed orbit fitting.

pub mod analysis;
pub mod ephemeris;
pub mod error;
pub mod files;
pub mod herget;
pub mod integrator;
pub mod kdtree;
pub mod kepler;
pub mod label;
pub mod linker;
pub mod merge;
pub mod orbitfit;
pub mod purify;
pub mod spherical;
pub mod tracklet;
pub mod types;

pub use error::{Error, Result};
