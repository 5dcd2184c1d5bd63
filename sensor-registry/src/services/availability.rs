//! Availability resolution.
//!
//! Partitions a query interval into maximal available/unavailable segments
//! from an item's mount history. Mounted means not available for redeployment.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use super::mount_timeline::MountTimeline;
use super::ServiceError;
use crate::models::{EquipmentRef, Interval, MountNodeId};

/// One contiguous piece of the query interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilitySegment {
    pub interval: Interval,
    pub available: bool,
    /// Node covering the start of an unavailable segment.
    pub mounting_node_id: Option<MountNodeId>,
    pub configuration_id: Option<i64>,
}

#[derive(Debug, Clone)]
struct Covered {
    interval: Interval,
    node_id: MountNodeId,
    configuration_id: i64,
}

/// Availability of one item over a query interval.
///
/// Holds the mount history clipped to the query; segments are computed on
/// demand by [`Availability::iter`], and every call starts a fresh pass.
#[derive(Debug, Clone)]
pub struct Availability {
    equipment: EquipmentRef,
    query: Interval,
    covered: Vec<Covered>,
}

impl Availability {
    pub fn equipment(&self) -> EquipmentRef {
        self.equipment
    }

    pub fn query(&self) -> Interval {
        self.query
    }

    pub fn iter(&self) -> AvailabilityIter<'_> {
        AvailabilityIter {
            availability: self,
            cursor: Some(self.query.begin()),
            next_node: 0,
        }
    }

    /// True when no node touches the query interval.
    pub fn is_fully_available(&self) -> bool {
        self.covered.is_empty()
    }
}

impl<'a> IntoIterator for &'a Availability {
    type Item = AvailabilitySegment;
    type IntoIter = AvailabilityIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Later of two optional ends, `None` being unbounded.
fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

fn reaches_past(end: Option<DateTime<Utc>>, instant: DateTime<Utc>) -> bool {
    end.is_none_or(|end| end > instant)
}

pub struct AvailabilityIter<'a> {
    availability: &'a Availability,
    /// Start of the next segment; `None` once the query is exhausted.
    cursor: Option<DateTime<Utc>>,
    next_node: usize,
}

impl Iterator for AvailabilityIter<'_> {
    type Item = AvailabilitySegment;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        let query_end = self.availability.query.end();
        if !reaches_past(query_end, cursor) {
            self.cursor = None;
            return None;
        }

        let covered = &self.availability.covered;
        while self.next_node < covered.len()
            && !reaches_past(covered[self.next_node].interval.end(), cursor)
        {
            self.next_node += 1;
        }

        let Some(first) = covered.get(self.next_node) else {
            self.cursor = None;
            return Some(AvailabilitySegment {
                interval: Interval::span(cursor, query_end),
                available: true,
                mounting_node_id: None,
                configuration_id: None,
            });
        };

        if first.interval.begin() > cursor {
            let gap_end = first.interval.begin();
            self.cursor = Some(gap_end);
            return Some(AvailabilitySegment {
                interval: Interval::span(cursor, Some(gap_end)),
                available: true,
                mounting_node_id: None,
                configuration_id: None,
            });
        }

        // Extend across overlapping and abutting nodes.
        let mut reach = first.interval.end();
        let mut index = self.next_node + 1;
        while index < covered.len()
            && reach.is_none_or(|reach| covered[index].interval.begin() <= reach)
        {
            reach = later(reach, covered[index].interval.end());
            index += 1;
        }
        self.next_node = index;
        self.cursor = reach;

        Some(AvailabilitySegment {
            interval: Interval::span(cursor, reach),
            available: false,
            mounting_node_id: Some(first.node_id),
            configuration_id: Some(first.configuration_id),
        })
    }
}

/// Computes availability from the mount timeline.
pub struct AvailabilityResolver {
    timeline: Arc<MountTimeline>,
}

impl AvailabilityResolver {
    pub fn new(timeline: Arc<MountTimeline>) -> Self {
        Self { timeline }
    }

    #[instrument(skip(self), fields(equipment = %equipment, query = %query))]
    pub async fn availability(
        &self,
        equipment: EquipmentRef,
        query: Interval,
    ) -> Result<Availability, ServiceError> {
        let covered = self
            .timeline
            .nodes_for(&equipment)
            .await?
            .into_iter()
            .filter_map(|node| {
                node.interval.intersection(&query).map(|interval| Covered {
                    interval,
                    node_id: node.id,
                    configuration_id: node.configuration_id,
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(nodes = covered.len(), "Resolved availability");
        Ok(Availability {
            equipment,
            query,
            covered,
        })
    }

    /// Availability for several items over the same query.
    pub async fn availability_many(
        &self,
        equipment: &[EquipmentRef],
        query: Interval,
    ) -> Result<Vec<Availability>, ServiceError> {
        join_all(
            equipment
                .iter()
                .map(|item| self.availability(*item, query)),
        )
        .await
        .into_iter()
        .collect()
    }

    /// True when the item is not mounted anywhere during `query`.
    pub async fn is_available(
        &self,
        equipment: EquipmentRef,
        query: Interval,
    ) -> Result<bool, ServiceError> {
        Ok(self.availability(equipment, query).await?.is_fully_available())
    }
}
