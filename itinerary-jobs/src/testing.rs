//! Fixtures shared by the test suites of this crate and of store implementations.
#![allow(clippy::unwrap_used)]

use chrono::NaiveDate;

use crate::itinerary::{Destination, Itinerary};

/// Itineraries the store test suite prepares jobs for, as `(itinerary id, owner id)`.
///
/// Stores that enforce ownership relationally must have these rows in place before running the
/// suite.
pub const FIXTURE_ITINERARIES: [(i32, i32); 3] = [(1, 1), (2, 1), (3, 2)];

pub fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
}

pub fn destination(city: &str, arrival: &str, departure: &str) -> Destination {
    Destination {
        country: "Italy".to_owned(),
        city: city.to_owned(),
        arrival_date: date(arrival),
        departure_date: date(departure),
    }
}

/// A valid two city itinerary.
pub fn mock_itinerary(id: i32, user_id: i32) -> Itinerary {
    Itinerary {
        id: id.into(),
        user_id: user_id.into(),
        title: "Summer in Italy".to_owned(),
        description: "Food and architecture".to_owned(),
        notes: Some("Vegetarian".to_owned()),
        destinations: vec![
            destination("Rome", "2024-06-01", "2024-06-04"),
            destination("Florence", "2024-06-04", "2024-06-08"),
        ],
    }
}
