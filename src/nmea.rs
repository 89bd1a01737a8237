//! NMEA 0183 sentence construction
//!
//! Builds `$GPGGA` and `$GPRMC` sentences from a `GpsFix` plus a selected
//! heading. Every builder here is infallible: malformed or extreme numeric
//! input is clamped or wrapped rather than propagated as an error, per the
//! robustness requirement that a bad sample must never take down the emit
//! loop.

use crate::types::{normalize_degrees, GpsFix};
use chrono::{DateTime, Utc};

/// Convert a signed decimal-degrees coordinate into NMEA's
/// degrees+decimal-minutes representation plus a hemisphere letter.
fn to_degrees_minutes(value: f64, positive_letter: char, negative_letter: char) -> (f64, char) {
    let letter = if value.is_sign_negative() { negative_letter } else { positive_letter };
    let abs = value.abs();
    let degrees = abs.trunc();
    let minutes = (abs - degrees) * 60.0;
    (degrees * 100.0 + minutes, letter)
}

fn parse_time_component(time_iso: Option<&str>) -> String {
    time_iso
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc).format("%H%M%S%.2f").to_string())
        .unwrap_or_else(|| "000000.00".to_string())
}

fn parse_date_component(time_iso: Option<&str>) -> String {
    time_iso
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc).format("%d%m%y").to_string())
        .unwrap_or_else(|| "010100".to_string())
}

/// XOR checksum of every byte between `$` and `*`, as two uppercase hex
/// digits.
fn checksum(body: &str) -> String {
    let cs = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{cs:02X}")
}

fn finish_sentence(body: String) -> String {
    let cs = checksum(&body);
    format!("${body}*{cs}\r\n")
}

/// Build a `$GPGGA` sentence: fix time, position, fix quality, satellite
/// count, HDOP and altitude. Has no heading field.
pub fn build_gga(fix: &GpsFix) -> String {
    let time = parse_time_component(fix.time_iso.as_deref());
    let (lat_nmea, lat_letter) = to_degrees_minutes(fix.lat, 'N', 'S');
    let (lon_nmea, lon_letter) = to_degrees_minutes(fix.lon, 'E', 'W');

    let body = format!(
        "GPGGA,{time},{lat:09.4},{lat_letter},{lon:010.4},{lon_letter},{q},{sats:02},{hdop:.1},{alt:.1},M,,,,",
        time = time,
        lat = lat_nmea,
        lat_letter = lat_letter,
        lon = lon_nmea,
        lon_letter = lon_letter,
        q = fix.fix_quality,
        sats = fix.num_sats.min(99),
        hdop = fix.hdop,
        alt = fix.alt,
    );
    finish_sentence(body)
}

/// Build a `$GPRMC` sentence: fix time, validity status, position, speed
/// (converted to knots), track (already normalized into `[0, 360)` by the
/// caller) and date.
pub fn build_rmc(fix: &GpsFix, heading_deg: f64) -> String {
    const MPS_TO_KNOTS: f64 = 1.943_844;

    let time = parse_time_component(fix.time_iso.as_deref());
    let date = parse_date_component(fix.time_iso.as_deref());
    let status = if fix.valid { 'A' } else { 'V' };
    let (lat_nmea, lat_letter) = to_degrees_minutes(fix.lat, 'N', 'S');
    let (lon_nmea, lon_letter) = to_degrees_minutes(fix.lon, 'E', 'W');
    let speed_knots = fix.speed_ms.max(0.0) * MPS_TO_KNOTS;
    let track = normalize_degrees(heading_deg);

    let body = format!(
        "GPRMC,{time},{status},{lat:09.4},{lat_letter},{lon:010.4},{lon_letter},{speed:.1},{track:.1},{date},,,",
        time = time,
        status = status,
        lat = lat_nmea,
        lat_letter = lat_letter,
        lon = lon_nmea,
        lon_letter = lon_letter,
        speed = speed_knots,
        track = track,
        date = date,
    );
    finish_sentence(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_fix() -> GpsFix {
        GpsFix::new(
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            Some("2024-01-01T12:00:00Z".to_string()),
            true,
            1,
            5,
            1.0,
        )
    }

    #[test]
    fn equator_gga_matches_expected_shape() {
        let fix = base_fix();
        let sentence = build_gga(&fix);
        assert!(sentence.starts_with("$GPGGA,120000.00,0000.0000,N,00000.0000,E,1,05,1.0,0.0,M,,,,*"));
        assert!(sentence.ends_with("\r\n"));
    }

    #[test]
    fn southwest_hemisphere_letters() {
        let mut fix = base_fix();
        fix.lat = -33.8688;
        fix.lon = 151.2093;
        let sentence = build_gga(&fix);
        assert!(sentence.contains(",S,"));
        assert!(sentence.contains(",E,"));

        fix.lon = -70.6693;
        let sentence = build_gga(&fix);
        assert!(sentence.contains(",S,"));
        assert!(sentence.contains(",W,"));
    }

    #[test]
    fn track_wraparound_in_rmc() {
        let fix = base_fix();
        assert!(build_rmc(&fix, -10.0).contains(",350.0,"));
        assert!(build_rmc(&fix, 370.0).contains(",10.0,"));
        assert!(build_rmc(&fix, 360.0).contains(",0.0,"));
    }

    #[test]
    fn checksum_is_correct_and_sentence_well_formed() {
        for sentence in [build_gga(&base_fix()), build_rmc(&base_fix(), 45.0)] {
            assert_eq!(sentence.matches('$').count(), 1);
            assert_eq!(sentence.matches('*').count(), 1);
            assert!(sentence.ends_with("\r\n"));

            let inner = &sentence[1..sentence.len() - 2];
            let (body, cs) = inner.split_once('*').unwrap();
            let expected = checksum(body);
            assert_eq!(expected, cs);
        }
    }

    #[test]
    fn extreme_inputs_never_panic() {
        let mut fix = base_fix();
        fix.lat = 1e30;
        fix.lon = -1e30;
        fix.num_sats = u32::MAX;
        let _ = build_gga(&fix);
        let _ = build_rmc(&fix, f64::INFINITY.min(1e9));
    }

    #[test]
    fn malformed_time_iso_falls_back_to_defaults() {
        let mut fix = base_fix();
        fix.time_iso = Some("not-a-timestamp".to_string());
        let gga = build_gga(&fix);
        assert!(gga.starts_with("$GPGGA,000000.00,"));
        let rmc = build_rmc(&fix, 0.0);
        assert!(rmc.contains(",010100,"));
    }

    #[test]
    fn rmc_status_reflects_validity() {
        let mut fix = base_fix();
        fix.valid = false;
        let sentence = build_rmc(&fix, 0.0);
        assert!(sentence.contains(",V,"));
    }
}
