//! Ephemeris sampling: gridded state tables for the Sun, Earth and
//! perturbing planets, observatory sites, and the configuration file
//! that ties them together for the integrator.

pub mod observer;
pub mod table;

pub use observer::{gmst_deg, obscode_lookup, observer_state, read_obscode_file, site_offset};
pub use table::{DEFAULT_POLY_ORDER, EphemerisTable};

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One perturbing planet: gravitational parameter plus the ephemeris
/// tables sampled on the integrator's forward and backward step grids.
#[derive(Clone, Debug)]
pub struct Planet {
    /// GM, km³/s²
    pub gm: f64,
    pub forward: EphemerisTable,
    pub backward: EphemerisTable,
}

/// Loaded solar-system model: everything the N-body integrator and the
/// observer-state calculations need.
#[derive(Clone, Debug)]
pub struct SolarSystem {
    /// Number of integrator sub-stage nodes, 3 ..= 8
    pub hnum: usize,
    /// Integrator step length, days
    pub timestep_days: f64,
    /// Barycentric Sun table (TDB grid)
    pub sun: EphemerisTable,
    /// Barycentric Earth table (TDB grid)
    pub earth: EphemerisTable,
    pub planets: Vec<Planet>,
}

impl SolarSystem {
    /// Parse the configuration file and load every table it names.
    ///
    /// The file is whitespace-tokenized with `#` comment lines, in order:
    /// HNUM, timestep (days), Sun ephemeris path, Earth ephemeris path,
    /// planet count, one GM per planet, then one forward and one backward
    /// ephemeris path per planet.
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut toks = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .flat_map(|l| l.split_whitespace());
        let mut next = |what: &str| {
            toks.next()
                .ok_or_else(|| Error::Usage(format!("configuration file ended before {what}")))
        };

        let hnum: usize = parse_tok(next("HNUM")?, "HNUM")?;
        if !(3..=8).contains(&hnum) {
            return Err(Error::Usage(format!("HNUM {hnum} outside 3..=8")));
        }
        let timestep_days: f64 = parse_tok(next("timestep")?, "timestep")?;
        if timestep_days <= 0.0 {
            return Err(Error::Usage(format!(
                "non-positive integrator timestep {timestep_days}"
            )));
        }
        let sun_path = resolve(path, next("Sun ephemeris path")?);
        let earth_path = resolve(path, next("Earth ephemeris path")?);
        let planet_count: usize = parse_tok(next("planet count")?, "planet count")?;

        let mut gms = Vec::with_capacity(planet_count);
        for i in 0..planet_count {
            gms.push(parse_tok(next("planet GM")?, &format!("GM of planet {i}"))?);
        }
        let mut planet_paths = Vec::with_capacity(planet_count);
        for _ in 0..planet_count {
            let fwd = resolve(path, next("forward ephemeris path")?);
            let back = resolve(path, next("backward ephemeris path")?);
            planet_paths.push((fwd, back));
        }

        let sun = EphemerisTable::load(&sun_path)?;
        let earth = EphemerisTable::load(&earth_path)?;
        let mut planets = Vec::with_capacity(planet_count);
        for (gm, (fwd, back)) in gms.into_iter().zip(planet_paths) {
            let forward = EphemerisTable::load(&fwd)?;
            let backward = EphemerisTable::load(&back)?;
            if forward.len() != backward.len() {
                log::warn!(
                    "forward/backward tables differ in length for {}: {} vs {}",
                    fwd.display(),
                    forward.len(),
                    backward.len()
                );
            }
            planets.push(Planet {
                gm,
                forward,
                backward,
            });
        }
        log::info!(
            "loaded solar system model: HNUM {hnum}, step {timestep_days} d, {} planets",
            planets.len()
        );
        Ok(Self {
            hnum,
            timestep_days,
            sun,
            earth,
            planets,
        })
    }

    /// Build a model directly from tables (used by tests and callers that
    /// generate their own ephemerides).
    pub fn from_parts(
        hnum: usize,
        timestep_days: f64,
        sun: EphemerisTable,
        earth: EphemerisTable,
        planets: Vec<Planet>,
    ) -> Self {
        Self {
            hnum,
            timestep_days,
            sun,
            earth,
            planets,
        }
    }
}

fn parse_tok<T: std::str::FromStr>(tok: &str, what: &str) -> Result<T> {
    tok.parse()
        .map_err(|_| Error::Usage(format!("unparseable {what}: '{tok}'")))
}

/// Table paths in the configuration file are taken relative to the
/// configuration file itself.
fn resolve(config_path: &Path, tok: &str) -> PathBuf {
    let p = Path::new(tok);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_path.parent().unwrap_or(Path::new(".")).join(p)
    }
}
