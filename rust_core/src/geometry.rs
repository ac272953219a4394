use crate::error::{Error, Result};
use crate::math::{wrap_two_pi, TWO_PI};

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// GPS epoch (1980-01-06 00:00 UTC) as a Julian date.
const GPS_EPOCH_JD: f64 = 2_444_244.5;
const J2000_JD: f64 = 2_451_545.0;

/// GPS times at which GPS − UTC grew by one second.
const LEAP_SECONDS: [f64; 18] = [
    46_828_800.0,
    78_364_801.0,
    109_900_802.0,
    173_059_203.0,
    252_028_804.0,
    315_187_205.0,
    346_723_206.0,
    393_984_007.0,
    425_520_008.0,
    457_056_009.0,
    504_489_610.0,
    551_750_411.0,
    599_184_012.0,
    820_108_813.0,
    914_803_214.0,
    1_025_136_015.0,
    1_119_744_016.0,
    1_167_264_017.0,
];

/// Ground-based interferometer, identified by its vertex position (ECEF, m).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interferometer {
    pub name: &'static str,
    pub vertex: [f64; 3],
}

const KNOWN_DETECTORS: [Interferometer; 3] = [
    Interferometer {
        name: "H1",
        vertex: [-2.161_414_926_36e6, -3.834_695_178_89e6, 4.600_350_226_64e6],
    },
    Interferometer {
        name: "L1",
        vertex: [-7.427_604_472_38e4, -5.496_283_719_71e6, 3.224_257_017_44e6],
    },
    Interferometer {
        name: "V1",
        vertex: [4.546_374_099e6, 8.429_896_976_26e5, 4.378_576_962_41e6],
    },
];

impl Interferometer {
    pub fn by_name(name: &str) -> Result<Self> {
        KNOWN_DETECTORS
            .iter()
            .find(|d| d.name == name)
            .copied()
            .ok_or_else(|| Error::config(format!("unknown detector `{name}`")))
    }

    /// Arrival time at this detector minus arrival time at the geocenter for
    /// a plane wave from `(ra, dec)` at GPS time `gps_time`.
    pub fn time_delay_from_geocenter(&self, ra: f64, dec: f64, gps_time: f64) -> f64 {
        let phi = ra - greenwich_mean_sidereal_time(gps_time);
        let omega = [dec.cos() * phi.cos(), dec.cos() * phi.sin(), dec.sin()];
        let dot: f64 = self.vertex.iter().zip(omega).map(|(r, o)| r * o).sum();
        -dot / SPEED_OF_LIGHT
    }
}

/// Ordered detector list, e.g. `["H1", "L1"]`.
pub fn interferometer_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Interferometer>> {
    if names.is_empty() {
        return Err(Error::config("detector list is empty"));
    }
    names.iter().map(|n| Interferometer::by_name(n.as_ref())).collect()
}

/// Leap seconds between GPS and UTC at a GPS time.
pub fn gps_leap_seconds(gps_time: f64) -> f64 {
    LEAP_SECONDS.iter().filter(|&&t| gps_time >= t).count() as f64
}

/// Greenwich mean sidereal time in radians, `[0, 2π)`.
///
/// IAU 1982 expression, UT1 approximated by UTC. The apparent sidereal time
/// differs by the equation of the equinoxes (about a second of time at most).
pub fn greenwich_mean_sidereal_time(gps_time: f64) -> f64 {
    let utc = gps_time - gps_leap_seconds(gps_time);
    let jd = GPS_EPOCH_JD + utc / 86_400.0;
    let d = jd - J2000_JD;
    let t = d / 36_525.0;
    let deg = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    wrap_two_pi(deg.to_radians())
}

/// Change of the Greenwich sidereal angle from `t_ref` to `t_event`, in `[0, 2π)`.
pub fn sidereal_rotation(t_ref: f64, t_event: f64) -> f64 {
    let delta = greenwich_mean_sidereal_time(t_event) - greenwich_mean_sidereal_time(t_ref);
    delta.rem_euclid(TWO_PI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_leap_seconds() {
        assert_eq!(gps_leap_seconds(0.0), 0.0);
        assert_eq!(gps_leap_seconds(1_126_259_462.4), 17.0);
        assert_eq!(gps_leap_seconds(1_187_008_882.4), 18.0);
    }

    #[test]
    fn test_gmst_sidereal_day() {
        // the Earth turns by 2π (plus ~1°) per solar day
        let t0 = 1_126_259_462.4;
        let one_day = greenwich_mean_sidereal_time(t0 + 86_400.0);
        let expected = wrap_two_pi(greenwich_mean_sidereal_time(t0) + 0.985_647_366_29f64.to_radians());
        assert_relative_eq!(one_day, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_gmst_known_value() {
        // 2000-01-01 12:00 UTC is GPS 630763213 (13 leap seconds); GMST = 280.46061837°
        let gmst = greenwich_mean_sidereal_time(630_763_213.0);
        assert_relative_eq!(gmst, 280.460_618_37f64.to_radians(), epsilon = 1e-6);
    }

    #[test]
    fn test_time_delay_bounded() {
        let h1 = Interferometer::by_name("H1").unwrap();
        let radius: f64 = h1.vertex.iter().map(|x| x * x).sum::<f64>().sqrt();
        for i in 0..50 {
            let ra = i as f64 * 0.13;
            let dec = -1.5 + i as f64 * 0.06;
            let dt = h1.time_delay_from_geocenter(ra, dec, 1e9);
            assert!(dt.abs() <= radius / SPEED_OF_LIGHT + 1e-12);
        }
        assert!(Interferometer::by_name("X9").is_err());
    }

    #[test]
    fn test_rotation_zero_for_equal_times() {
        assert_eq!(sidereal_rotation(1e9, 1e9), 0.0);
    }
}
