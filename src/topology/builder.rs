//! Topology descriptor building and validation

use super::{
    Cache, CacheId, CacheLevel, Core, CoreId, NumaNode, NumaNodeId, Pu, PuId, Socket, SocketId,
    Strength, Topology,
};
use std::collections::HashSet;
use thiserror::Error;

/// Ways in which a topology descriptor can be rejected at construction
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TopologyError {
    /// Two PUs were declared with the same cpuset index
    #[error("duplicate PU id {0}")]
    DuplicatePuId(PuId),

    /// Following lower-cache links from some cache never reaches memory
    #[error("cycle in cache relations involving cache #{0}")]
    CacheCycle(usize),

    /// A PU was declared with a strength of zero
    #[error("{0} has zero strength")]
    ZeroStrength(PuId),

    /// A PU is stronger than the declared normalization constant
    #[error("{pu} has strength {strength}, above the declared maximum {max}")]
    StrengthAboveMax {
        pu: PuId,
        strength: Strength,
        max: Strength,
    },

    /// The descriptor contains no PU at all
    #[error("topology contains no PUs")]
    NoPus,

    /// A cache was associated with a PU the descriptor never declared
    #[error("cache #{cache} is associated with undeclared {pu}")]
    UnknownPu { cache: usize, pu: PuId },
}

/// [`Topology`] that is in the process of being described
///
/// The handles returned by the factory methods are only meaningful for the
/// builder that produced them; validation happens in [`build()`](Self::build).
///
/// ```
/// use sisal::topology::{CacheLevel, PuId, TopologyBuilder};
///
/// let mut builder = TopologyBuilder::new();
/// let socket = builder.socket();
/// let numa_node = builder.numa_node();
/// let l2 = builder.cache(CacheLevel::L2);
/// let core = builder.core(socket, numa_node);
/// builder.attach_cache(core, l2);
/// builder.pu(core, PuId(24), 100_000);
/// builder.pu(core, PuId(26), 70_000);
/// let topology = builder.build().expect("descriptor is well-formed");
/// assert_eq!(topology.num_pus(), 2);
/// ```
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    /// Core handles per socket, in attachment order
    sockets: Vec<Vec<usize>>,

    /// Core descriptions
    cores: Vec<CoreSpec>,

    /// PU descriptions, in declaration order
    pus: Vec<PuSpec>,

    /// Cache descriptions
    caches: Vec<CacheSpec>,

    /// Core handles per NUMA node, in attachment order
    numa_nodes: Vec<Vec<usize>>,

    /// Explicitly declared normalization constant, if any
    max_strength: Option<Strength>,
}
//
impl TopologyBuilder {
    /// Start describing a machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the normalization constant explicitly
    ///
    /// Without this, the maximum declared PU strength is used. Declaring a
    /// constant below some PU's strength makes [`build()`](Self::build) fail.
    pub fn max_strength(&mut self, max: Strength) -> &mut Self {
        self.max_strength = Some(max);
        self
    }

    /// Declare a socket
    pub fn socket(&mut self) -> SocketId {
        self.sockets.push(Vec::new());
        SocketId(self.sockets.len() - 1)
    }

    /// Declare a NUMA node
    pub fn numa_node(&mut self) -> NumaNodeId {
        self.numa_nodes.push(Vec::new());
        NumaNodeId(self.numa_nodes.len() - 1)
    }

    /// Declare a cache at a given level of the hierarchy
    pub fn cache(&mut self, level: CacheLevel) -> CacheId {
        self.caches.push(CacheSpec {
            level,
            lower: None,
            higher: Vec::new(),
            pus: Vec::new(),
        });
        CacheId(self.caches.len() - 1)
    }

    /// Declare a core on a socket and NUMA node
    pub fn core(&mut self, socket: SocketId, numa_node: NumaNodeId) -> CoreId {
        let core = self.cores.len();
        self.cores.push(CoreSpec {
            socket: socket.0,
            numa_node: numa_node.0,
            pus: Vec::new(),
            caches: [None; 3],
        });
        self.sockets[socket.0].push(core);
        self.numa_nodes[numa_node.0].push(core);
        CoreId(core)
    }

    /// Declare a PU on a core
    ///
    /// `id` is the OS-visible cpuset index used for pinning, `strength` the
    /// PU's relative power when running in isolation.
    pub fn pu(&mut self, core: CoreId, id: PuId, strength: Strength) -> &mut Self {
        let pu = self.pus.len();
        self.pus.push(PuSpec {
            id,
            strength,
            core: core.0,
        });
        self.cores[core.0].pus.push(pu);
        self
    }

    /// Record a core's cache entry, slotted by the cache's level
    ///
    /// PUs later declared on the core (and those already declared) are
    /// associated with the cache at build time. A shared cache may be attached
    /// to several cores.
    pub fn attach_cache(&mut self, core: CoreId, cache: CacheId) -> &mut Self {
        let level = self.caches[cache.0].level;
        self.cores[core.0].caches[level as usize] = Some(cache.0);
        self
    }

    /// Associate a PU with a cache
    ///
    /// Idempotent: associating the same PU twice records it once.
    pub fn associate_pu(&mut self, cache: CacheId, pu: PuId) -> &mut Self {
        let pus = &mut self.caches[cache.0].pus;
        if !pus.contains(&pu) {
            pus.push(pu);
        }
        self
    }

    /// Associate `lower` as `upper`'s next cache toward memory
    ///
    /// Also records `upper` among `lower`'s higher caches; the inverse
    /// relation is kept consistent, and the operation is idempotent (no
    /// duplicate higher-cache entry).
    pub fn associate_lower_cache(&mut self, upper: CacheId, lower: CacheId) -> &mut Self {
        if let Some(previous) = self.caches[upper.0].lower.replace(lower.0) {
            if previous != lower.0 {
                self.caches[previous].higher.retain(|&c| c != upper.0);
            }
        }
        let higher = &mut self.caches[lower.0].higher;
        if !higher.contains(&upper.0) {
            higher.push(upper.0);
        }
        self
    }

    /// Validate the descriptor and freeze it into a [`Topology`]
    pub fn build(self) -> Result<Topology, TopologyError> {
        if self.pus.is_empty() {
            return Err(TopologyError::NoPus);
        }

        // PU ids must be unique, strengths positive and below the maximum
        let mut seen_ids = HashSet::with_capacity(self.pus.len());
        let mut observed_max: Strength = 0;
        for pu in &self.pus {
            if !seen_ids.insert(pu.id) {
                return Err(TopologyError::DuplicatePuId(pu.id));
            }
            if pu.strength == 0 {
                return Err(TopologyError::ZeroStrength(pu.id));
            }
            observed_max = observed_max.max(pu.strength);
        }
        let max_strength = match self.max_strength {
            Some(max) => {
                if let Some(pu) = self.pus.iter().find(|pu| pu.strength > max) {
                    return Err(TopologyError::StrengthAboveMax {
                        pu: pu.id,
                        strength: pu.strength,
                        max,
                    });
                }
                max
            }
            None => observed_max,
        };

        // Lower-cache links must reach memory in finitely many hops
        for start in 0..self.caches.len() {
            let mut current = Some(start);
            for _ in 0..=self.caches.len() {
                match current {
                    Some(cache) => current = self.caches[cache].lower,
                    None => break,
                }
            }
            if current.is_some() {
                return Err(TopologyError::CacheCycle(start));
            }
        }

        // Explicit cache/PU associations must name declared PUs
        for (cache, spec) in self.caches.iter().enumerate() {
            for &pu in &spec.pus {
                if !seen_ids.contains(&pu) {
                    return Err(TopologyError::UnknownPu { cache, pu });
                }
            }
        }

        // Derive cache/PU associations from the cores' cache entries
        let mut caches: Vec<Cache> = self
            .caches
            .iter()
            .map(|spec| {
                Topology::make_cache(
                    spec.level,
                    spec.pus.clone(),
                    spec.lower.map(CacheId),
                    spec.higher.iter().copied().map(CacheId).collect(),
                )
            })
            .collect();
        for core in &self.cores {
            for cache in core.caches.iter().flatten() {
                for &pu in &core.pus {
                    let pus = &mut caches[*cache].associated_pus;
                    let id = self.pus[pu].id;
                    if !pus.contains(&id) {
                        pus.push(id);
                    }
                }
            }
        }

        // Materialize the depth-first PU enumeration: sockets in declaration
        // order, a socket's cores in attachment order, a core's PUs in
        // declaration order
        let mut pus = Vec::with_capacity(self.pus.len());
        for socket in &self.sockets {
            for &core in socket {
                for &pu in &self.cores[core].pus {
                    let spec = &self.pus[pu];
                    pus.push(Topology::make_pu(spec.id, spec.strength, CoreId(spec.core)));
                }
            }
        }
        debug_assert_eq!(pus.len(), self.pus.len(), "every core sits on a socket");

        let cores = self
            .cores
            .iter()
            .map(|spec| {
                Topology::make_core(
                    SocketId(spec.socket),
                    NumaNodeId(spec.numa_node),
                    spec.pus.iter().map(|&pu| self.pus[pu].id).collect(),
                    spec.caches.map(|c| c.map(CacheId)),
                )
            })
            .collect();
        let sockets = self
            .sockets
            .into_iter()
            .map(|cores| Topology::make_socket(cores.into_iter().map(CoreId).collect()))
            .collect();
        let numa_nodes = self
            .numa_nodes
            .into_iter()
            .map(|cores| Topology::make_numa_node(cores.into_iter().map(CoreId).collect()))
            .collect();

        Ok(Topology::from_parts(
            sockets,
            cores,
            pus,
            caches,
            numa_nodes,
            max_strength,
        ))
    }
}

/// Core that is in the process of being described
#[derive(Debug)]
struct CoreSpec {
    /// Socket handle
    socket: usize,

    /// NUMA node handle
    numa_node: usize,

    /// PU handles, in declaration order
    pus: Vec<usize>,

    /// Cache handles, slotted by level
    caches: [Option<usize>; 3],
}

/// PU that is in the process of being described
#[derive(Debug)]
struct PuSpec {
    /// OS-visible cpuset index
    id: PuId,

    /// Isolated strength
    strength: Strength,

    /// Core handle
    core: usize,
}

/// Cache that is in the process of being described
#[derive(Debug)]
struct CacheSpec {
    /// Position in the cache hierarchy
    level: CacheLevel,

    /// Next cache toward memory
    lower: Option<usize>,

    /// Caches that draw from this one
    higher: Vec<usize>,

    /// Explicitly associated PUs
    pus: Vec<PuId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builder with one socket/node/core, ready for PU declarations
    fn one_core_builder() -> (TopologyBuilder, CoreId) {
        let mut builder = TopologyBuilder::new();
        let socket = builder.socket();
        let numa_node = builder.numa_node();
        let core = builder.core(socket, numa_node);
        (builder, core)
    }

    #[test]
    fn empty_descriptor() {
        assert_eq!(
            TopologyBuilder::new().build().unwrap_err(),
            TopologyError::NoPus
        );
    }

    #[test]
    fn duplicate_pu_id() {
        let (mut builder, core) = one_core_builder();
        builder.pu(core, PuId(0), 1).pu(core, PuId(0), 1);
        assert_eq!(
            builder.build().unwrap_err(),
            TopologyError::DuplicatePuId(PuId(0))
        );
    }

    #[test]
    fn zero_strength() {
        let (mut builder, core) = one_core_builder();
        builder.pu(core, PuId(0), 0);
        assert_eq!(
            builder.build().unwrap_err(),
            TopologyError::ZeroStrength(PuId(0))
        );
    }

    #[test]
    fn strength_above_declared_max() {
        let (mut builder, core) = one_core_builder();
        builder.max_strength(50_000).pu(core, PuId(0), 70_000);
        assert_eq!(
            builder.build().unwrap_err(),
            TopologyError::StrengthAboveMax {
                pu: PuId(0),
                strength: 70_000,
                max: 50_000,
            }
        );
    }

    #[test]
    fn implicit_max_strength() {
        let (mut builder, core) = one_core_builder();
        builder.pu(core, PuId(0), 70_000).pu(core, PuId(1), 30_000);
        assert_eq!(builder.build().unwrap().max_strength(), 70_000);
    }

    #[test]
    fn cache_self_loop() {
        let (mut builder, core) = one_core_builder();
        let l1 = builder.cache(CacheLevel::L1);
        builder.associate_lower_cache(l1, l1);
        builder.pu(core, PuId(0), 1);
        assert_eq!(builder.build().unwrap_err(), TopologyError::CacheCycle(0));
    }

    #[test]
    fn cache_cycle() {
        let (mut builder, core) = one_core_builder();
        let l1 = builder.cache(CacheLevel::L1);
        let l2 = builder.cache(CacheLevel::L2);
        builder.associate_lower_cache(l1, l2);
        builder.associate_lower_cache(l2, l1);
        builder.pu(core, PuId(0), 1);
        assert!(matches!(
            builder.build().unwrap_err(),
            TopologyError::CacheCycle(_)
        ));
    }

    #[test]
    fn lower_cache_association_is_idempotent() {
        let mut once = TopologyBuilder::new();
        let mut twice = TopologyBuilder::new();
        for builder in [&mut once, &mut twice] {
            let socket = builder.socket();
            let numa_node = builder.numa_node();
            let core = builder.core(socket, numa_node);
            builder.pu(core, PuId(0), 1);
        }
        let (l1, l2) = (once.cache(CacheLevel::L1), once.cache(CacheLevel::L2));
        once.associate_lower_cache(l1, l2);
        let (l1, l2) = (twice.cache(CacheLevel::L1), twice.cache(CacheLevel::L2));
        twice.associate_lower_cache(l1, l2);
        twice.associate_lower_cache(l1, l2);

        let (once, twice) = (once.build().unwrap(), twice.build().unwrap());
        assert_eq!(once.cache(l2).higher_caches(), twice.cache(l2).higher_caches());
        assert_eq!(twice.cache(l2).higher_caches(), &[l1]);
    }

    #[test]
    fn lower_cache_reassociation_updates_inverse() {
        let (mut builder, core) = one_core_builder();
        let l1 = builder.cache(CacheLevel::L1);
        let l2_a = builder.cache(CacheLevel::L2);
        let l2_b = builder.cache(CacheLevel::L2);
        builder.associate_lower_cache(l1, l2_a);
        builder.associate_lower_cache(l1, l2_b);
        builder.pu(core, PuId(0), 1);
        let topology = builder.build().unwrap();
        assert!(topology.cache(l2_a).higher_caches().is_empty());
        assert_eq!(topology.cache(l2_b).higher_caches(), &[l1]);
        assert_eq!(topology.cache(l1).lower_cache(), Some(l2_b));
    }

    #[test]
    fn explicit_pu_association_is_idempotent() {
        let (mut builder, core) = one_core_builder();
        let l3 = builder.cache(CacheLevel::L3);
        builder.pu(core, PuId(7), 1);
        builder.associate_pu(l3, PuId(7));
        builder.associate_pu(l3, PuId(7));
        let topology = builder.build().unwrap();
        assert_eq!(topology.cache(l3).associated_pus(), &[PuId(7)]);
    }

    #[test]
    fn unknown_pu_association() {
        let (mut builder, core) = one_core_builder();
        let l3 = builder.cache(CacheLevel::L3);
        builder.pu(core, PuId(0), 1);
        builder.associate_pu(l3, PuId(9));
        assert_eq!(
            builder.build().unwrap_err(),
            TopologyError::UnknownPu {
                cache: 0,
                pu: PuId(9),
            }
        );
    }
}
