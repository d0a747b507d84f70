//! Routing and spectrum assignment.
//!
//! Shortest-path computation over the POP multigraph by physical
//! length, slot sizing from bandwidth and modulation, and first-fit
//! spectrum allocation with slot continuity across the whole path.
//! Planning is read-only: slots are claimed later, inside the
//! connection manager's create transaction.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::domain::{
    InterfaceName, LinkId, Modulation, NetworkLink, PathSegment, PopId, PopNode,
};
use crate::error::{ControllerError, Result};
use crate::store::ResourceStore;

/// Result of a complete path computation: an ordered segment list with
/// the planned (not yet claimed) slot run, plus the advisory OSNR.
#[derive(Debug, Clone)]
pub struct PathPlan {
    pub segments: Vec<PathSegment>,
    pub required_slots: u16,
    pub estimated_osnr: Option<f64>,
}

/// Path computation engine. The topology snapshot is immutable after
/// construction; only slot occupancy is re-read from the store.
pub struct PathComputer {
    store: Arc<dyn ResourceStore>,
    pops: HashMap<PopId, PopNode>,
    links: HashMap<LinkId, NetworkLink>,
    adjacency: HashMap<PopId, Vec<(PopId, LinkId, f64)>>,
    config: ControllerConfig,
}

struct HeapEntry {
    dist: f64,
    pop: PopId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the BinaryHeap pops the closest POP first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.pop.cmp(&self.pop))
    }
}

impl PathComputer {
    /// Loads the topology from the store and builds the graph.
    pub async fn new(store: Arc<dyn ResourceStore>, config: &ControllerConfig) -> Result<Self> {
        let (pops, links) = store.load_topology().await?;
        Ok(Self::with_topology(store, pops, links, config))
    }

    /// Builds the engine from an already-loaded topology snapshot.
    #[must_use]
    pub fn with_topology(
        store: Arc<dyn ResourceStore>,
        pops: HashMap<PopId, PopNode>,
        links: HashMap<LinkId, NetworkLink>,
        config: &ControllerConfig,
    ) -> Self {
        let mut adjacency: HashMap<PopId, Vec<(PopId, LinkId, f64)>> = HashMap::new();
        for link in links.values() {
            adjacency.entry(link.pop_a.clone()).or_default().push((
                link.pop_b.clone(),
                link.id.clone(),
                link.length_km,
            ));
            adjacency.entry(link.pop_b.clone()).or_default().push((
                link.pop_a.clone(),
                link.id.clone(),
                link.length_km,
            ));
        }
        // Deterministic exploration order; together with the relaxation
        // tie-break this makes equal-length path choices stable.
        for neighbors in adjacency.values_mut() {
            neighbors.sort_by(|a, b| a.1.cmp(&b.1));
        }

        info!(
            pops = pops.len(),
            links = links.len(),
            "built topology graph"
        );
        Self {
            store,
            pops,
            links,
            adjacency,
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn pop(&self, id: &PopId) -> Option<&PopNode> {
        self.pops.get(id)
    }

    #[must_use]
    pub fn link(&self, id: &LinkId) -> Option<&NetworkLink> {
        self.links.get(id)
    }

    #[must_use]
    pub fn pops(&self) -> &HashMap<PopId, PopNode> {
        &self.pops
    }

    /// Shortest path by physical length, as an ordered list of link ids.
    ///
    /// Dijkstra with a binary heap, terminating as soon as the
    /// destination is settled. Equal-length alternatives resolve to the
    /// lexicographically smaller link id.
    #[instrument(skip(self), fields(source = %source, destination = %destination))]
    pub fn shortest_path(&self, source: &PopId, destination: &PopId) -> Result<Vec<LinkId>> {
        if !self.pops.contains_key(source) {
            return Err(ControllerError::InvalidRequest(format!(
                "source POP {source} not found in topology"
            )));
        }
        if !self.pops.contains_key(destination) {
            return Err(ControllerError::InvalidRequest(format!(
                "destination POP {destination} not found in topology"
            )));
        }

        let mut dist: HashMap<PopId, f64> = HashMap::new();
        let mut prev: HashMap<PopId, (PopId, LinkId)> = HashMap::new();
        let mut settled: HashSet<PopId> = HashSet::new();
        let mut heap = BinaryHeap::new();

        dist.insert(source.clone(), 0.0);
        heap.push(HeapEntry {
            dist: 0.0,
            pop: source.clone(),
        });

        while let Some(HeapEntry { dist: d, pop }) = heap.pop() {
            if pop == *destination {
                break;
            }
            if !settled.insert(pop.clone()) {
                continue;
            }

            for (neighbor, link_id, weight) in
                self.adjacency.get(&pop).map(Vec::as_slice).unwrap_or(&[])
            {
                let candidate = d + weight;
                let known = dist.get(neighbor).copied().unwrap_or(f64::INFINITY);
                let improves = candidate < known;
                let ties_better = candidate == known
                    && prev
                        .get(neighbor)
                        .is_some_and(|(_, current)| link_id < current);
                if improves || ties_better {
                    dist.insert(neighbor.clone(), candidate);
                    prev.insert(neighbor.clone(), (pop.clone(), link_id.clone()));
                    if improves {
                        heap.push(HeapEntry {
                            dist: candidate,
                            pop: neighbor.clone(),
                        });
                    }
                }
            }
        }

        if !dist.contains_key(destination) {
            warn!("no path found");
            return Err(ControllerError::NoPath {
                from: source.clone(),
                destination: destination.clone(),
            });
        }

        let mut path = Vec::new();
        let mut current = destination.clone();
        while let Some((parent, link_id)) = prev.get(&current) {
            path.push(link_id.clone());
            current = parent.clone();
        }
        path.reverse();

        debug!(hops = path.len(), "computed shortest path");
        Ok(path)
    }

    /// Number of slots needed for the bandwidth at the given modulation,
    /// never less than one.
    #[must_use]
    pub fn required_slots(&self, bandwidth_gbps: f64, modulation: Modulation) -> u16 {
        let efficiency = self.config.spectral_efficiency_for(modulation);
        let required_ghz = bandwidth_gbps / efficiency;
        let slots = (required_ghz / self.config.slot_width_ghz).ceil();
        (slots.max(1.0)) as u16
    }

    /// First-fit spectrum selection with continuity: the lowest-indexed
    /// contiguous run of `required` slots that is free on every link of
    /// the path. A path that would need per-link slot conversion is
    /// rejected.
    #[instrument(skip(self, path), fields(links = path.len(), required))]
    pub async fn plan_spectrum(&self, path: &[LinkId], required: u16) -> Result<Vec<u16>> {
        let Some(first) = path.first() else {
            return Err(ControllerError::InvalidRequest(
                "cannot allocate spectrum on an empty path".to_string(),
            ));
        };

        let first_free = self.store.get_available_slots(first).await?;
        let mut rest_free = Vec::with_capacity(path.len().saturating_sub(1));
        for link in &path[1..] {
            let free: HashSet<u16> = self
                .store
                .get_available_slots(link)
                .await?
                .into_iter()
                .collect();
            rest_free.push(free);
        }

        let required = required as usize;
        if first_free.len() >= required {
            for window in first_free.windows(required) {
                let contiguous = window
                    .windows(2)
                    .all(|pair| pair[0] + 1 == pair[1]);
                if !contiguous {
                    continue;
                }
                let free_everywhere = rest_free
                    .iter()
                    .all(|free| window.iter().all(|slot| free.contains(slot)));
                if free_everywhere {
                    debug!(slots = ?window, "selected spectrum run");
                    return Ok(window.to_vec());
                }
            }
        }

        warn!("no contiguous run free on every link");
        Err(ControllerError::NoSpectrum(format!(
            "no contiguous run of {required} slots free on all {} links",
            path.len()
        )))
    }

    /// Advisory OSNR estimate from total path length: 25 dB at 100 km,
    /// scaling inversely, rounded to 2 decimals.
    #[must_use]
    pub fn estimate_osnr(&self, path: &[LinkId]) -> Option<f64> {
        let total_km: f64 = path
            .iter()
            .filter_map(|id| self.links.get(id))
            .map(|link| link.length_km)
            .sum();
        if total_km > 0.0 {
            Some((25.0 * 100.0 / total_km * 100.0).round() / 100.0)
        } else {
            None
        }
    }

    /// Pre-flight validation: both POPs exist, requested endpoint
    /// interfaces are available, and a route exists.
    pub async fn validate_endpoints(
        &self,
        source: &PopId,
        destination: &PopId,
        source_interface: Option<&InterfaceName>,
        destination_interface: Option<&InterfaceName>,
    ) -> Result<()> {
        if !self.pops.contains_key(source) {
            return Err(ControllerError::InvalidRequest(format!(
                "source POP {source} not found"
            )));
        }
        if !self.pops.contains_key(destination) {
            return Err(ControllerError::InvalidRequest(format!(
                "destination POP {destination} not found"
            )));
        }

        if let Some(name) = source_interface {
            self.check_interface_available(source, name).await?;
        }
        if let Some(name) = destination_interface {
            self.check_interface_available(destination, name).await?;
        }

        self.shortest_path(source, destination)?;
        Ok(())
    }

    async fn check_interface_available(&self, pop: &PopId, name: &InterfaceName) -> Result<()> {
        let node = self
            .pops
            .get(pop)
            .ok_or_else(|| ControllerError::InvalidRequest(format!("POP {pop} not found")))?;
        for router in &node.routers {
            let available = self.store.available_interfaces(pop, router).await?;
            if available.contains(name) {
                return Ok(());
            }
        }
        Err(ControllerError::ResourceUnavailable(format!(
            "interface {name} not available on {pop}"
        )))
    }

    /// Complete path computation: route, slot sizing, first-fit plan,
    /// and OSNR estimate. Read-only with respect to the store.
    #[instrument(skip(self), fields(source = %source, destination = %destination, bandwidth_gbps))]
    pub async fn compute(
        &self,
        source: &PopId,
        destination: &PopId,
        bandwidth_gbps: f64,
        modulation: Modulation,
    ) -> Result<PathPlan> {
        let path = self.shortest_path(source, destination)?;
        let required = self.required_slots(bandwidth_gbps, modulation);
        let slots = self.plan_spectrum(&path, required).await?;

        let segments = path
            .iter()
            .filter_map(|id| self.links.get(id))
            .map(|link| PathSegment {
                link_id: link.id.clone(),
                source_pop: link.pop_a.clone(),
                destination_pop: link.pop_b.clone(),
                allocated_slots: slots.clone(),
                slot_width_ghz: self.config.slot_width_ghz,
            })
            .collect();
        let estimated_osnr = self.estimate_osnr(&path);

        info!(
            segments = path.len(),
            required,
            ?estimated_osnr,
            "computed complete path"
        );
        Ok(PathPlan {
            segments,
            required_slots: required,
            estimated_osnr,
        })
    }
}
