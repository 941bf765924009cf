//! Machine-topology model: sockets, cores, PUs, caches and NUMA relations
//!
//! The model is an immutable description of the machine that the worker pool
//! and scheduler run against. It is built once from a descriptor supplied by
//! the embedder (see [`TopologyBuilder`]), validated at construction, and read
//! concurrently without synchronization thereafter. Discovering the machine
//! from the OS is the embedder's business; [`Topology::detect()`] only offers
//! a uniform-strength default for embedders that do not care.

pub(crate) mod builder;

pub use builder::{TopologyBuilder, TopologyError};

use std::fmt;

/// Relative compute rate of a PU running in isolation
///
/// Unitless: only comparisons and ratios between strengths are meaningful.
pub type Strength = u64;

/// Strength assigned to every PU by the convenience constructors
///
/// Matches the historical calibration point of the weight-balancing scheduler,
/// so that embedder-supplied heterogeneous descriptors mix well with detected
/// ones.
pub(crate) const DEFAULT_STRENGTH: Strength = 100_000;

/// OS-visible cpuset index of a logical processor
///
/// This is the index used for thread pinning, not a dense 0..num_pus counter:
/// a machine may expose PUs 24 and 26 only.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PuId(pub usize);
//
impl fmt::Display for PuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PU{}", self.0)
    }
}

/// Handle to a socket within the [`Topology`] that created it
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SocketId(pub(crate) usize);

/// Handle to a core within the [`Topology`] that created it
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CoreId(pub(crate) usize);

/// Handle to a NUMA node within the [`Topology`] that created it
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NumaNodeId(pub(crate) usize);

/// Handle to a cache within the [`Topology`] that created it
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CacheId(pub(crate) usize);

/// Position of a cache in the hierarchy, from closest to the PU to closest to
/// memory
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

/// A logical processor: one OS-visible hardware thread
///
/// Distinct from a [`Core`], which may host several PUs (hyperthreading).
#[derive(Debug)]
pub struct Pu {
    /// OS-visible cpuset index
    id: PuId,

    /// Relative power of this PU when nothing else is running
    isolated_strength: Strength,

    /// Core this PU belongs to
    core: CoreId,
}
//
impl Pu {
    /// OS-visible cpuset index of this PU
    pub fn id(&self) -> PuId {
        self.id
    }

    /// Power of this PU assuming it runs in isolation
    pub fn isolated_strength(&self) -> Strength {
        self.isolated_strength
    }

    /// Core hosting this PU
    pub fn core(&self) -> CoreId {
        self.core
    }
}

/// A physical core, hosting one or more PUs
#[derive(Debug)]
pub struct Core {
    /// Socket this core belongs to
    socket: SocketId,

    /// NUMA node this core belongs to
    numa_node: NumaNodeId,

    /// PUs hosted by this core, in topology order
    pus: Vec<PuId>,

    /// Cache entries of this core, indexed by [`CacheLevel`]
    caches: [Option<CacheId>; 3],
}
//
impl Core {
    /// Socket this core belongs to
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// NUMA node this core belongs to
    pub fn numa_node(&self) -> NumaNodeId {
        self.numa_node
    }

    /// PUs hosted by this core
    pub fn pus(&self) -> &[PuId] {
        &self.pus
    }

    /// Cache of this core at a given level, if declared
    pub fn cache(&self, level: CacheLevel) -> Option<CacheId> {
        self.caches[level as usize]
    }
}

/// A socket, owning an ordered sequence of cores
#[derive(Debug)]
pub struct Socket {
    /// Cores on this socket, in topology order
    cores: Vec<CoreId>,
}
//
impl Socket {
    /// Cores on this socket
    pub fn cores(&self) -> &[CoreId] {
        &self.cores
    }
}

/// A cache, related to the PUs that use it and to its neighbors in the
/// hierarchy
#[derive(Debug)]
pub struct Cache {
    /// Position in the cache hierarchy
    level: CacheLevel,

    /// PUs that draw from this cache
    associated_pus: Vec<PuId>,

    /// The cache this cache uses, e.g. for an L1 this would be the L2
    lower_cache: Option<CacheId>,

    /// Caches which draw from this one, e.g. for an L2 the associated L1s
    higher_caches: Vec<CacheId>,
}
//
impl Cache {
    /// Position in the cache hierarchy
    pub fn level(&self) -> CacheLevel {
        self.level
    }

    /// PUs that draw from this cache
    pub fn associated_pus(&self) -> &[PuId] {
        &self.associated_pus
    }

    /// The next-lower cache, toward memory
    pub fn lower_cache(&self) -> Option<CacheId> {
        self.lower_cache
    }

    /// The next-higher caches, toward the PUs
    pub fn higher_caches(&self) -> &[CacheId] {
        &self.higher_caches
    }
}

/// A memory affinity domain grouping cores with uniform access latency
#[derive(Debug)]
pub struct NumaNode {
    /// Cores attached to this node, in topology order
    cores: Vec<CoreId>,
}
//
impl NumaNode {
    /// Cores attached to this node
    pub fn cores(&self) -> &[CoreId] {
        &self.cores
    }
}

/// Immutable description of the machine the pool runs against
///
/// Sockets own cores, cores own PUs, forming a strict tree; caches and NUMA
/// nodes are related to that tree through non-owning handles. All strengths
/// are frozen at construction.
#[derive(Debug)]
pub struct Topology {
    /// Sockets, in topology order
    sockets: Vec<Socket>,

    /// Cores, addressed by [`CoreId`]
    cores: Vec<Core>,

    /// PUs in depth-first topology order
    ///
    /// This is the enumeration behind [`pus()`](Self::pus), materialized once
    /// at construction so repeat calls cost nothing.
    pus: Vec<Pu>,

    /// Caches, addressed by [`CacheId`]
    caches: Vec<Cache>,

    /// NUMA nodes, addressed by [`NumaNodeId`]
    numa_nodes: Vec<NumaNode>,

    /// Normalization constant: at least as large as every PU strength
    max_strength: Strength,
}
//
impl Topology {
    /// Number of PUs on the machine
    pub fn num_pus(&self) -> usize {
        self.pus.len()
    }

    /// Number of cores on the machine
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Number of sockets on the machine
    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// All PUs, in depth-first topology order
    ///
    /// The enumeration is cached at construction, so this is a plain slice
    /// access no matter how often it is called.
    pub fn pus(&self) -> &[Pu] {
        &self.pus
    }

    /// Isolated strength of the PU with a given cpuset index
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this topology.
    pub fn pu_strength(&self, id: PuId) -> Strength {
        self.pu(id).isolated_strength
    }

    /// Normalization constant, at least as large as every PU strength
    pub fn max_strength(&self) -> Strength {
        self.max_strength
    }

    /// Sockets on the machine, in topology order
    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// Core behind a [`CoreId`] handle
    pub fn core(&self, id: CoreId) -> &Core {
        &self.cores[id.0]
    }

    /// Cache behind a [`CacheId`] handle
    pub fn cache(&self, id: CacheId) -> &Cache {
        &self.caches[id.0]
    }

    /// NUMA node behind a [`NumaNodeId`] handle
    pub fn numa_node(&self, id: NumaNodeId) -> &NumaNode {
        &self.numa_nodes[id.0]
    }

    /// Core hosting the PU with a given cpuset index
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this topology.
    pub fn core_of(&self, id: PuId) -> &Core {
        &self.cores[self.pu(id).core.0]
    }

    /// PUs drawing from the same cache as `id` at a given level
    ///
    /// `None` if the PU's core declared no cache at that level. The returned
    /// set includes `id` itself.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this topology.
    pub fn pus_sharing_cache(&self, id: PuId, level: CacheLevel) -> Option<&[PuId]> {
        let cache = self.core_of(id).cache(level)?;
        Some(self.cache(cache).associated_pus())
    }

    /// Uniform-strength topology with one single-PU core per cpuset index
    ///
    /// Handy for tests and for embedders that do not model heterogeneity: all
    /// PUs get [the default strength](DEFAULT_STRENGTH), one socket, one NUMA
    /// node, no cache description.
    pub fn homogeneous(pu_ids: impl IntoIterator<Item = usize>) -> Result<Self, TopologyError> {
        let mut builder = TopologyBuilder::new();
        let socket = builder.socket();
        let numa_node = builder.numa_node();
        for pu_id in pu_ids {
            let core = builder.core(socket, numa_node);
            builder.pu(core, PuId(pu_id), DEFAULT_STRENGTH);
        }
        builder.build()
    }

    /// Best-effort topology for the machine this process runs on
    ///
    /// Enumerates the OS-visible CPUs and assigns them uniform strength. This
    /// is a convenience for embedders without a calibrated descriptor, not a
    /// substitute for one: cache, NUMA and strength information is absent.
    pub fn detect() -> Result<Self, TopologyError> {
        let pu_ids: Vec<usize> = match core_affinity::get_core_ids() {
            Some(ids) if !ids.is_empty() => ids.into_iter().map(|core_id| core_id.id).collect(),
            _ => {
                let fallback = std::thread::available_parallelism().map_or(1, usize::from);
                log::warn!("could not enumerate CPUs, assuming cpuset indices 0..{fallback}");
                (0..fallback).collect()
            }
        };
        Self::homogeneous(pu_ids)
    }

    /// PU record behind a cpuset index
    fn pu(&self, id: PuId) -> &Pu {
        self.pus
            .iter()
            .find(|pu| pu.id == id)
            .unwrap_or_else(|| panic!("{id} is not part of this topology"))
    }

    /// Assemble a validated topology (only the builder gets to do this)
    pub(crate) fn from_parts(
        sockets: Vec<Socket>,
        cores: Vec<Core>,
        pus: Vec<Pu>,
        caches: Vec<Cache>,
        numa_nodes: Vec<NumaNode>,
        max_strength: Strength,
    ) -> Self {
        Self {
            sockets,
            cores,
            pus,
            caches,
            numa_nodes,
            max_strength,
        }
    }

    /// Constructor pieces for [`Core`], used by the builder
    pub(crate) fn make_core(
        socket: SocketId,
        numa_node: NumaNodeId,
        pus: Vec<PuId>,
        caches: [Option<CacheId>; 3],
    ) -> Core {
        Core {
            socket,
            numa_node,
            pus,
            caches,
        }
    }

    /// Constructor pieces for [`Pu`], used by the builder
    pub(crate) fn make_pu(id: PuId, isolated_strength: Strength, core: CoreId) -> Pu {
        Pu {
            id,
            isolated_strength,
            core,
        }
    }

    /// Constructor pieces for [`Socket`], used by the builder
    pub(crate) fn make_socket(cores: Vec<CoreId>) -> Socket {
        Socket { cores }
    }

    /// Constructor pieces for [`Cache`], used by the builder
    pub(crate) fn make_cache(
        level: CacheLevel,
        associated_pus: Vec<PuId>,
        lower_cache: Option<CacheId>,
        higher_caches: Vec<CacheId>,
    ) -> Cache {
        Cache {
            level,
            associated_pus,
            lower_cache,
            higher_caches,
        }
    }

    /// Constructor pieces for [`NumaNode`], used by the builder
    pub(crate) fn make_numa_node(cores: Vec<CoreId>) -> NumaNode {
        NumaNode { cores }
    }
}
