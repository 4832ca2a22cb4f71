#![cfg(feature = "live-api-tests")]

use chrono::{Duration as ChronoDuration, Utc};
use tidecast::{fetch_series, NormalizeConfig, SensorApiConfig};

#[test]
fn live_endpoint_returns_a_recent_series() {
    let end = Utc::now();
    let start = end - ChronoDuration::hours(6);

    let fetched = fetch_series(
        start,
        end,
        2,
        &SensorApiConfig::default(),
        &NormalizeConfig::default(),
    )
    .expect("live sensor API should answer");

    assert!(fetched.pages >= 1);
    let observations = fetched.series.observations();
    assert!(observations
        .windows(2)
        .all(|pair| pair[0].time < pair[1].time));
    assert!(observations
        .iter()
        .all(|obs| obs.time >= start && obs.time <= end));
}
