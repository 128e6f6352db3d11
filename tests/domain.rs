use std::str::FromStr;

use assert_matches::assert_matches;

use nbia_fetch::domain::{ApiHost, SeriesUid, Species, is_dicom_uid};
use nbia_fetch::error::NbiaError;

#[test]
fn parse_series_uid() {
    let uid = SeriesUid::from_str("1.3.6.1.4.1.14519.5.2.1.7695.1700.1003").unwrap();
    assert_eq!(uid.to_string(), "1.3.6.1.4.1.14519.5.2.1.7695.1700.1003");
}

#[test]
fn reject_non_dicom_uids() {
    for raw in ["", "abc", "1..2", "1.2.", "1", format!("1.{}", "2".repeat(63)).as_str()] {
        assert_matches!(
            SeriesUid::from_str(raw),
            Err(NbiaError::InvalidSeriesUid(_)),
            "{raw} should be rejected"
        );
    }
    assert!(is_dicom_uid("0.0"));
}

#[test]
fn series_uid_round_trips_through_serde() {
    let uid: SeriesUid = serde_json::from_str("\"1.2.840.10008.1\"").unwrap();
    assert_eq!(serde_json::to_string(&uid).unwrap(), "\"1.2.840.10008.1\"");
    assert!(serde_json::from_str::<SeriesUid>("\"not.a.uid\"").is_err());
}

#[test]
fn species_map_to_snomed_codes() {
    assert_eq!(Species::from_str("Mouse").unwrap().snomed_code(), 447612001);
    assert_eq!(Species::Dog.snomed_code(), 448771007);
    assert!(Species::from_str("cat").is_err());
}

#[test]
fn api_hosts() {
    assert_eq!(
        ApiHost::default().base_url(),
        "https://services.cancerimagingarchive.net/nbia-api/services"
    );
    assert_matches!("public".parse::<ApiHost>(), Err(NbiaError::InvalidApiHost(_)));
}
