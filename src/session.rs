use crate::error::{Result, VoxelError};
use crate::model::StagePosition;
use crate::storage::VoxelStorage;
use log::info;
use std::sync::Arc;

/// How written samples relate to the displayed volume.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PlacementState {
    Idle,
    /// Relative placement: display volumes follow the stage from `reference`.
    LiveView { reference: StagePosition },
    /// Absolute placement: data is shown where it was written.
    TileAcquisition,
}
impl PlacementState {
    pub fn name(&self) -> &'static str {
        match self {
            PlacementState::Idle => "idle",
            PlacementState::LiveView { .. } => "live view",
            PlacementState::TileAcquisition => "tile acquisition",
        }
    }
}

/// Drives a shared [`VoxelStorage`] through `Idle -> LiveView -> Idle -> TileAcquisition -> Idle`.
///
/// A reference position still present when tile acquisition starts is reported as
/// [`VoxelError::StaleReference`] and left in place; it is never cleared implicitly.
pub struct AcquisitionSession {
    storage: Arc<VoxelStorage>,
    state: PlacementState,
}

impl AcquisitionSession {
    pub fn new(storage: Arc<VoxelStorage>) -> Self {
        Self {
            storage,
            state: PlacementState::Idle,
        }
    }

    pub fn storage(&self) -> &Arc<VoxelStorage> {
        &self.storage
    }
    pub fn state(&self) -> PlacementState {
        self.state
    }

    fn expect_idle(&self, to: PlacementState) -> Result<()> {
        match self.state {
            PlacementState::Idle => Ok(()),
            other => Err(VoxelError::InvalidTransition {
                from: other.name(),
                to: to.name(),
            }),
        }
    }

    /// Anchors relative placement at the stage position of the first live frame.
    pub fn start_live_view(&mut self, first_frame: StagePosition) -> Result<()> {
        let next = PlacementState::LiveView { reference: first_frame };
        self.expect_idle(next)?;
        self.storage.set_reference_position(first_frame);
        self.state = next;
        info!("live view started at {:?}", first_frame);
        Ok(())
    }

    /// Clears the reference (and the transform cache) and returns it.
    pub fn stop_live_view(&mut self) -> Result<StagePosition> {
        let PlacementState::LiveView { reference } = self.state else {
            return Err(VoxelError::InvalidTransition {
                from: self.state.name(),
                to: PlacementState::Idle.name(),
            });
        };
        self.storage.clear_reference_position();
        self.state = PlacementState::Idle;
        Ok(reference)
    }

    pub fn start_tile_acquisition(&mut self) -> Result<()> {
        self.expect_idle(PlacementState::TileAcquisition)?;
        if self.storage.reference_position().is_some() {
            return Err(VoxelError::StaleReference);
        }
        self.state = PlacementState::TileAcquisition;
        info!("tile acquisition started");
        Ok(())
    }

    pub fn stop_tile_acquisition(&mut self) -> Result<()> {
        if self.state != PlacementState::TileAcquisition {
            return Err(VoxelError::InvalidTransition {
                from: self.state.name(),
                to: PlacementState::Idle.name(),
            });
        }
        self.state = PlacementState::Idle;
        Ok(())
    }
}
