//! The merged composition and its dependency graph.
//!
//! Services live in an index-addressed table; dependency edges are
//! `(target index, readiness)` pairs, so the graph carries no pointer
//! identity and serializes trivially. The additive filter marks a service
//! together with the transitive closure of its dependencies, which is how
//! `up service-a` selects the subgraph that must be brought up.

use super::types::{ClusterImageStorage, ComposeService, Readiness};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One dependency edge of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Index of the antecedent service in the composition's table.
    pub target: usize,
    /// Readiness level the antecedent must reach.
    pub readiness: Readiness,
}

/// A service node in the composition graph.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    /// Unique service name.
    pub name: String,
    /// Merged document-level configuration. Its `depends_on` map is empty;
    /// the resolved edges live in [`Service::depends_on`].
    pub compose: ComposeService,
    /// Resolved dependency edges.
    pub depends_on: Vec<Dependency>,
    #[serde(skip)]
    matches_filter: bool,
}

/// The merged, validated composition.
#[derive(Debug, Clone, Serialize)]
pub struct Composition {
    services: Vec<Service>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Where the cluster pulls built volume-init images from.
    pub cluster_image_storage: ClusterImageStorage,
    /// Base image override for volume-init images.
    pub volume_init_base_image: Option<String>,
}

impl Composition {
    /// Creates an empty composition.
    pub fn new(
        cluster_image_storage: ClusterImageStorage,
        volume_init_base_image: Option<String>,
    ) -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            cluster_image_storage,
            volume_init_base_image,
        }
    }

    /// Registers a service and returns its index.
    ///
    /// # Panics
    ///
    /// Panics when the name is already registered, or when the service
    /// still carries unresolved `depends_on` entries; dependencies are
    /// linked by [`Composition::link_dependencies`] after every service has
    /// been added.
    pub fn add_service(&mut self, name: &str, compose: ComposeService) -> usize {
        assert!(
            !self.index.contains_key(name),
            "duplicate service name {name:?}"
        );
        assert!(
            compose.depends_on.is_empty(),
            "service {name:?} must be registered before its dependencies are linked"
        );
        let idx = self.services.len();
        self.services.push(Service {
            name: name.to_string(),
            compose,
            depends_on: Vec::new(),
            matches_filter: false,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when the composition has no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// All services, index-addressed.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// The service at `idx`.
    pub fn service(&self, idx: usize) -> &Service {
        &self.services[idx]
    }

    /// Looks up a service index by name.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Looks up a service by name.
    pub fn find_service_by_name(&self, name: &str) -> Option<&Service> {
        self.find_index(name).map(|idx| &self.services[idx])
    }

    /// Resolves named dependency maps into graph edges and validates the
    /// result: every target must exist, a `healthy` requirement needs an
    /// enabled probe on the target, and the relation must be acyclic.
    pub(crate) fn link_dependencies(
        &mut self,
        dependencies: &BTreeMap<String, BTreeMap<String, Readiness>>,
    ) -> Result<()> {
        for (name, deps) in dependencies {
            let idx = self
                .find_index(name)
                .unwrap_or_else(|| panic!("dependencies for unregistered service {name:?}"));
            let mut edges = Vec::with_capacity(deps.len());
            for (target_name, readiness) in deps {
                let target = self.find_index(target_name).ok_or_else(|| {
                    Error::Graph(format!(
                        "service {name:?} depends on unknown service {target_name:?}"
                    ))
                })?;
                if *readiness == Readiness::Healthy && !self.services[target].compose.probe_enabled()
                {
                    return Err(Error::Graph(format!(
                        "service {name:?} requires {target_name:?} to be healthy, but {target_name:?} has no enabled health probe"
                    )));
                }
                edges.push(Dependency {
                    target,
                    readiness: *readiness,
                });
            }
            self.services[idx].depends_on = edges;
        }
        self.reject_cycles()?;
        debug!(services = self.services.len(), "linked dependency graph");
        Ok(())
    }

    fn reject_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        fn visit(services: &[Service], marks: &mut [Mark], idx: usize) -> Result<()> {
            match marks[idx] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(Error::Graph(format!(
                        "dependency cycle involving service {:?}",
                        services[idx].name
                    )))
                }
                Mark::Unvisited => {}
            }
            marks[idx] = Mark::InProgress;
            for dep in &services[idx].depends_on {
                visit(services, marks, dep.target)?;
            }
            marks[idx] = Mark::Done;
            Ok(())
        }
        let mut marks = vec![Mark::Unvisited; self.services.len()];
        for idx in 0..self.services.len() {
            visit(&self.services, &mut marks, idx)?;
        }
        Ok(())
    }

    /// Returns service indices in an order where every service appears
    /// after all of its dependencies. Ties break by index, so the order is
    /// deterministic.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.services.len());
        let mut placed = vec![false; self.services.len()];
        while order.len() < self.services.len() {
            for idx in 0..self.services.len() {
                if placed[idx] {
                    continue;
                }
                let ready = self.services[idx]
                    .depends_on
                    .iter()
                    .all(|d| placed[d.target]);
                if ready {
                    placed[idx] = true;
                    order.push(idx);
                }
            }
        }
        order
    }

    // =========================================================================
    // Filtering
    // =========================================================================

    /// Marks `idx` and the transitive closure of its dependencies.
    /// Additive across calls.
    pub fn add_to_filter(&mut self, idx: usize) {
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            if self.services[current].matches_filter {
                continue;
            }
            self.services[current].matches_filter = true;
            for dep in &self.services[current].depends_on {
                stack.push(dep.target);
            }
        }
    }

    /// True when `idx` has been marked by [`Composition::add_to_filter`].
    pub fn matches_filter(&self, idx: usize) -> bool {
        self.services[idx].matches_filter
    }

    /// Clears all filter marks.
    pub fn clear_filter(&mut self) {
        for service in &mut self.services {
            service.matches_filter = false;
        }
    }

    /// True when any service is marked.
    pub fn has_filter(&self) -> bool {
        self.services.iter().any(|s| s.matches_filter)
    }

    /// Indices selected for bring-up: the marked subgraph when a filter is
    /// set, every service otherwise.
    pub fn selected(&self) -> Vec<usize> {
        if self.has_filter() {
            (0..self.services.len())
                .filter(|&idx| self.services[idx].matches_filter)
                .collect()
        } else {
            (0..self.services.len()).collect()
        }
    }
}
