// The shared GPU context
//
// Everything a resource constructor needs: the device, the memory heap,
// the binding set registry, the transfer engine and the data source.
// Built once and shared by reference, there is no global state.
use crate::data::{DataSource, ReadSeek};
use crate::device::GpuDevice;
use crate::heap::DeviceHeap;
use crate::loader::{AsyncTransferEngine, JobState};
use crate::registry::BindingSetRegistry;
use crate::resource::ResourceId;
use crate::transfer::{TransferJob, TransferJobId};
use crate::{CreateInfo, Result};

use std::sync::{Arc, Mutex};

pub struct GpuContext {
    // The transfer engine goes first so in flight work is waited on
    // before anything else is torn down
    gc_transfer: Mutex<AsyncTransferEngine>,
    gc_registry: Arc<BindingSetRegistry>,
    gc_heap: Arc<DeviceHeap>,
    gc_data: Arc<dyn DataSource>,
    gc_dev: Arc<dyn GpuDevice>,
    gc_info: CreateInfo,
}

impl GpuContext {
    pub fn new(
        dev: Arc<dyn GpuDevice>,
        data: Arc<dyn DataSource>,
        info: &CreateInfo,
    ) -> Result<Self> {
        let heap = Arc::new(DeviceHeap::new(dev.clone(), info)?);
        let registry = Arc::new(BindingSetRegistry::new(dev.clone()));
        let transfer = AsyncTransferEngine::new(dev.clone())?;

        log::info!(
            "Created GPU context: {} byte arenas, {} sets per material",
            info.arena_size(),
            info.set_count
        );

        Ok(Self {
            gc_transfer: Mutex::new(transfer),
            gc_registry: registry,
            gc_heap: heap,
            gc_data: data,
            gc_dev: dev,
            gc_info: info.clone(),
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.gc_dev
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.gc_heap
    }

    pub fn registry(&self) -> &Arc<BindingSetRegistry> {
        &self.gc_registry
    }

    pub fn data(&self) -> &Arc<dyn DataSource> {
        &self.gc_data
    }

    pub fn info(&self) -> &CreateInfo {
        &self.gc_info
    }

    /// Open the blob for `id` from the data source
    pub fn open(&self, id: ResourceId) -> Result<Box<dyn ReadSeek>> {
        self.gc_data.open(id)
    }

    /// Queue a transfer for the next update
    pub fn submit(&self, job: TransferJob) -> TransferJobId {
        self.gc_transfer.lock().unwrap().submit(job)
    }

    pub fn job_state(&self, id: TransferJobId) -> JobState {
        self.gc_transfer.lock().unwrap().job_state(id)
    }

    /// The least advanced state among `ids`
    pub fn jobs_state(&self, ids: &[TransferJobId]) -> JobState {
        self.gc_transfer.lock().unwrap().jobs_state(ids)
    }

    pub fn has_pending_work(&self) -> bool {
        self.gc_transfer.lock().unwrap().has_pending_work()
    }

    /// Pump the transfer engine once, never blocks
    pub fn update(&self) -> Result<usize> {
        self.gc_transfer.lock().unwrap().update()
    }

    /// Block until all queued transfers have completed
    pub fn wait_idle(&self) -> Result<usize> {
        self.gc_transfer.lock().unwrap().wait_idle()
    }
}
