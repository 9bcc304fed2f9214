//! SubTimeFrame data model and the readout accumulator.

use std::sync::Arc;

use crate::detector::DataOrigin;
use crate::error::{DataDistError, Result};
use crate::pool::{MemoryPool, PoolLease, PooledMessage};

/// Where an STF came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StfOrigin {
    /// Built from readout data.
    Readout,
    /// Synthetic gap filler; carries no equipment groups.
    Null,
}

/// Identifier of the equipment an HBF run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EquipmentIdentifier {
    pub origin: DataOrigin,
    pub subspec: u32,
    pub link_id: u8,
}

/// One inserted run of HBFs sharing an equipment identifier.
///
/// Runs are kept in insertion order; the same equipment may appear again
/// later when the readout interleaves subspecifications.
#[derive(Debug)]
pub struct EquipmentGroup {
    pub equipment: EquipmentIdentifier,
    pub hbfs: Vec<PooledMessage>,
}

/// Pool bytes reserved per equipment descriptor when a group is opened.
pub const EQUIPMENT_DESC_SIZE: u64 = 64;

/// Aggregate of all HBFs sharing one TF id at this builder.
///
/// Created lazily by the accumulator on the first HBF of a new id, mutated
/// only by the assembly stage, finalized exactly once, then owned uniquely by
/// the sequencer and finally the outbound stage. Dropping the STF releases
/// every payload and descriptor lease back to the pool.
#[derive(Debug)]
pub struct SubTimeFrame {
    id: u64,
    origin: StfOrigin,
    groups: Vec<EquipmentGroup>,
    descriptors: Vec<PoolLease>,
    data_size: u64,
    first_orbit: u32,
}

impl SubTimeFrame {
    /// A synthetic empty STF (sequencer gap filler).
    pub fn empty(id: u64) -> Self {
        debug_assert!(id >= 1, "STF ids start at 1");
        Self {
            id,
            origin: StfOrigin::Null,
            groups: Vec::new(),
            descriptors: Vec::new(),
            data_size: 0,
            first_orbit: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> StfOrigin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: StfOrigin) {
        self.origin = origin;
    }

    /// Total payload bytes across all groups.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Orbit counter of the first HBF inserted.
    pub fn first_orbit(&self) -> u32 {
        self.first_orbit
    }

    /// Groups in insertion order.
    pub fn groups(&self) -> &[EquipmentGroup] {
        &self.groups
    }

    /// Distinct participating equipment identifiers.
    pub fn equipment_identifiers(&self) -> Vec<EquipmentIdentifier> {
        let mut ids: Vec<EquipmentIdentifier> =
            self.groups.iter().map(|g| g.equipment).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Consume the STF for serialization.
    pub fn into_groups(self) -> Vec<EquipmentGroup> {
        // Descriptor leases drop here; payload leases travel with the parts.
        self.groups
    }

    pub fn hbf_count(&self) -> usize {
        self.groups.iter().map(|g| g.hbfs.len()).sum()
    }
}

/// Accumulates HBF runs into the STF currently being built.
///
/// Exactly one accumulator is active per builder node; it owns the partial
/// STF between the first HBF of an id and finalization.
pub struct StfAccumulator {
    pool: Arc<MemoryPool>,
    current: Option<SubTimeFrame>,
}

impl StfAccumulator {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        Self {
            pool,
            current: None,
        }
    }

    /// Id of the STF in progress, if any.
    pub fn current_stf_id(&self) -> Option<u64> {
        self.current.as_ref().map(SubTimeFrame::id)
    }

    /// Insert one run of HBFs sharing a subspecification.
    ///
    /// Lazily opens the STF on the first run of a new id. Each run reserves
    /// an equipment descriptor from the pool; this is the assembly stage's
    /// backpressure point and fails only once the pool is stopped.
    pub fn add_hbf_run(
        &mut self,
        stf_id: u64,
        equipment: EquipmentIdentifier,
        orbit: u32,
        hbfs: Vec<PooledMessage>,
    ) -> Result<usize> {
        let inserted = hbfs.len();
        if inserted == 0 {
            return Ok(0);
        }

        let lease = self
            .pool
            .allocate(EQUIPMENT_DESC_SIZE)
            .ok_or(DataDistError::PoolStopped)?;

        let stf = match self.current.as_mut() {
            Some(stf) => {
                debug_assert_eq!(stf.id(), stf_id, "run for a different TF id");
                stf
            }
            None => {
                let mut stf = SubTimeFrame::empty(stf_id);
                stf.origin = StfOrigin::Readout;
                stf.first_orbit = orbit;
                self.current.insert(stf)
            }
        };

        let run_size: u64 = hbfs.iter().map(|m| m.len() as u64).sum();
        stf.descriptors.push(lease);
        stf.groups.push(EquipmentGroup { equipment, hbfs });
        stf.data_size += run_size;
        Ok(inserted)
    }

    /// Finalize: hand out the completed STF and reset for the next id.
    ///
    /// `None` when nothing valid was inserted since the last finalization
    /// (bookkeeping-only case).
    pub fn take(&mut self) -> Option<SubTimeFrame> {
        self.current.take()
    }
}
