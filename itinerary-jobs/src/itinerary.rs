//! The itinerary snapshot a job is generated from.
//!
//! Itineraries are owned by the CRUD layer; the job engine only ever sees an immutable copy taken
//! when the job is prepared. Later edits to the itinerary do not reach a job that is already in
//! flight.
use std::fmt::Display;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The maximum number of destinations an itinerary can hold.
pub const MAX_DESTINATIONS: usize = 20;
/// The maximum number of days between the first arrival and the last departure.
pub const MAX_SPAN_DAYS: i64 = 30;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItineraryId(i32);

impl From<i32> for ItineraryId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<ItineraryId> for i32 {
    fn from(value: ItineraryId) -> Self {
        value.0
    }
}

impl Display for ItineraryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ItineraryId({})", self.0)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i32);

impl From<i32> for UserId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<UserId> for i32 {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: ItineraryId,
    pub user_id: UserId,
    pub title: String,
    pub description: String,
    pub notes: Option<String>,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub country: String,
    pub city: String,
    pub arrival_date: NaiveDate,
    pub departure_date: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItineraryError {
    #[error("Itinerary must have between 1 and {MAX_DESTINATIONS} destinations, found {0}")]
    DestinationCount(usize),
    #[error("Departure from {city} is before its arrival")]
    DepartureBeforeArrival { city: String },
    #[error("Itinerary spans {0} days, the maximum is {MAX_SPAN_DAYS}")]
    SpanTooLong(i64),
}

impl Itinerary {
    /// Check the destination count and date constraints of the snapshot.
    pub fn validate(&self) -> Result<(), ItineraryError> {
        if self.destinations.is_empty() || self.destinations.len() > MAX_DESTINATIONS {
            return Err(ItineraryError::DestinationCount(self.destinations.len()));
        }
        if let Some(destination) = self
            .destinations
            .iter()
            .find(|destination| destination.departure_date < destination.arrival_date)
        {
            return Err(ItineraryError::DepartureBeforeArrival {
                city: destination.city.clone(),
            });
        }
        let span = self.span_days();
        if span > MAX_SPAN_DAYS {
            return Err(ItineraryError::SpanTooLong(span));
        }
        Ok(())
    }

    /// Days between the earliest arrival and the latest departure.
    pub fn span_days(&self) -> i64 {
        let first = self.destinations.iter().map(|d| d.arrival_date).min();
        let last = self.destinations.iter().map(|d| d.departure_date).max();
        match (first, last) {
            (Some(first), Some(last)) => (last - first).num_days(),
            _ => 0,
        }
    }

    /// Destinations ordered by arrival date.
    pub fn ordered_destinations(&self) -> Vec<&Destination> {
        let mut destinations = self.destinations.iter().collect::<Vec<_>>();
        destinations.sort_by_key(|destination| destination.arrival_date);
        destinations
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{date, destination, mock_itinerary};
    use assert_matches::assert_matches;

    #[test]
    fn validate_accepts_mock() {
        assert_eq!(mock_itinerary(1, 1).validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_empty_and_too_many_destinations() {
        let mut itinerary = mock_itinerary(1, 1);
        itinerary.destinations.clear();
        assert_eq!(
            itinerary.validate(),
            Err(ItineraryError::DestinationCount(0))
        );

        itinerary.destinations = (0..21)
            .map(|_| destination("Rome", "2024-06-01", "2024-06-02"))
            .collect();
        assert_eq!(
            itinerary.validate(),
            Err(ItineraryError::DestinationCount(21))
        );
    }

    #[test]
    fn validate_rejects_long_span() {
        let mut itinerary = mock_itinerary(1, 1);
        itinerary
            .destinations
            .push(destination("Milan", "2024-06-20", "2024-07-02"));

        assert_eq!(itinerary.span_days(), 31);
        assert_eq!(itinerary.validate(), Err(ItineraryError::SpanTooLong(31)));
    }

    #[test]
    fn validate_rejects_departure_before_arrival() {
        let mut itinerary = mock_itinerary(1, 1);
        itinerary.destinations[1].departure_date = date("2024-06-02");

        assert_matches!(
            itinerary.validate(),
            Err(ItineraryError::DepartureBeforeArrival { city }) if city == "Florence"
        );
    }

    #[test]
    fn ordered_destinations_sorts_by_arrival() {
        let mut itinerary = mock_itinerary(1, 1);
        itinerary.destinations.reverse();

        let cities = itinerary
            .ordered_destinations()
            .into_iter()
            .map(|d| d.city.as_str())
            .collect::<Vec<_>>();
        assert_eq!(cities, ["Rome", "Florence"]);
    }
}
