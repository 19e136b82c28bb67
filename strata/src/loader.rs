// Asynchronous transfer engine
//
// Jobs are queued by submit() and batched into one command buffer on the
// transfer queue. update() never blocks: it checks the batch fence, runs
// completions for a finished batch, and submits the next one. Only one
// batch is in flight at a time so the single command buffer can be reused.
use crate::device::GpuDevice;
use crate::transfer::{TransferJob, TransferJobId};
use crate::Result;
use ash::vk;
use utils::timing::StopWatch;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the next batch
    Pending,
    /// On the device, fence not yet signaled
    Submitted,
    /// Copy done and completion run, or the id was never issued
    Completed,
}

pub struct AsyncTransferEngine {
    te_dev: Arc<dyn GpuDevice>,
    te_cbuf: vk::CommandBuffer,
    te_fence: vk::Fence,
    te_pending: VecDeque<(TransferJobId, TransferJob)>,
    te_in_flight: Vec<(TransferJobId, TransferJob)>,
    te_next_id: u64,
    /// Number of batches submitted so far
    te_batches: u64,
    te_watch: StopWatch,
}

impl AsyncTransferEngine {
    pub fn new(dev: Arc<dyn GpuDevice>) -> Result<Self> {
        let cbuf = dev.allocate_transfer_cbuf()?;
        let fence = match dev.create_fence(false) {
            Ok(f) => f,
            Err(e) => {
                dev.free_transfer_cbuf(cbuf);
                return Err(e);
            }
        };

        Ok(Self {
            te_dev: dev,
            te_cbuf: cbuf,
            te_fence: fence,
            te_pending: VecDeque::new(),
            te_in_flight: Vec::new(),
            te_next_id: 0,
            te_batches: 0,
            te_watch: StopWatch::new(),
        })
    }

    /// Queue `job` for the next batch
    pub fn submit(&mut self, job: TransferJob) -> TransferJobId {
        let id = TransferJobId(self.te_next_id);
        self.te_next_id += 1;

        log::trace!("Queued {} ({} bytes)", id, job.size());
        self.te_pending.push_back((id, job));
        id
    }

    /// Retire a finished batch and submit the next one
    ///
    /// Returns the number of jobs completed by this call. Completions run
    /// in submission order.
    pub fn update(&mut self) -> Result<usize> {
        let mut completed = 0;

        if !self.te_in_flight.is_empty() {
            if !self.te_dev.fence_signaled(self.te_fence)? {
                return Ok(0);
            }
            completed = self.retire_batch();
        }

        if !self.te_pending.is_empty() {
            self.submit_batch()?;
        }

        Ok(completed)
    }

    /// Block until every queued job has completed
    pub fn wait_idle(&mut self) -> Result<usize> {
        let mut completed = 0;

        loop {
            if !self.te_in_flight.is_empty() {
                self.te_dev.wait_fence(self.te_fence)?;
                completed += self.retire_batch();
            }
            if self.te_pending.is_empty() {
                return Ok(completed);
            }
            self.submit_batch()?;
        }
    }

    fn retire_batch(&mut self) -> usize {
        let count = self.te_in_flight.len();

        for (id, job) in self.te_in_flight.drain(..) {
            log::trace!("Completed {}", id);
            job.complete();
        }

        self.te_watch.end();
        log::debug!(
            "Transfer batch {} finished: {} jobs in {} ms",
            self.te_batches,
            count,
            self.te_watch.get_duration().as_millis()
        );

        count
    }

    fn submit_batch(&mut self) -> Result<()> {
        debug_assert!(self.te_in_flight.is_empty());
        let dev = self.te_dev.as_ref();

        dev.reset_fence(self.te_fence)?;
        dev.cbuf_begin_recording(self.te_cbuf)?;
        for (_, job) in self.te_pending.iter() {
            job.record(dev, self.te_cbuf)?;
        }
        dev.cbuf_end_recording(self.te_cbuf)?;
        dev.submit_transfer(self.te_cbuf, self.te_fence)?;

        self.te_batches += 1;
        self.te_watch.start();
        log::debug!(
            "Submitted transfer batch {} with {} jobs",
            self.te_batches,
            self.te_pending.len()
        );
        self.te_in_flight.extend(self.te_pending.drain(..));

        Ok(())
    }

    pub fn job_state(&self, id: TransferJobId) -> JobState {
        if self.te_pending.iter().any(|(i, _)| *i == id) {
            JobState::Pending
        } else if self.te_in_flight.iter().any(|(i, _)| *i == id) {
            JobState::Submitted
        } else {
            JobState::Completed
        }
    }

    /// The least advanced state among `ids`
    pub fn jobs_state(&self, ids: &[TransferJobId]) -> JobState {
        let ids: HashSet<_> = ids.iter().copied().collect();

        if self.te_pending.iter().any(|(i, _)| ids.contains(i)) {
            JobState::Pending
        } else if self.te_in_flight.iter().any(|(i, _)| ids.contains(i)) {
            JobState::Submitted
        } else {
            JobState::Completed
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.te_pending.is_empty() || !self.te_in_flight.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.te_pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.te_in_flight.len()
    }

    pub fn batches_submitted(&self) -> u64 {
        self.te_batches
    }
}

impl Drop for AsyncTransferEngine {
    fn drop(&mut self) {
        if !self.te_in_flight.is_empty() {
            match self.te_dev.wait_fence(self.te_fence) {
                Ok(()) => {
                    self.retire_batch();
                }
                Err(e) => log::error!("Could not wait for transfers in flight: {}", e),
            }
        }
        if !self.te_pending.is_empty() {
            log::debug!("Dropping {} unsubmitted transfers", self.te_pending.len());
        }
        // Drop staging buffers before the cbuf that references them
        self.te_pending.clear();
        self.te_in_flight.clear();

        self.te_dev.free_transfer_cbuf(self.te_cbuf);
        self.te_dev.destroy_fence(self.te_fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buffer, CreateInfo, DeviceHeap, HeadlessDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn setup() -> (Arc<HeadlessDevice>, Arc<DeviceHeap>, AsyncTransferEngine) {
        let dev = Arc::new(HeadlessDevice::new());
        let heap = Arc::new(DeviceHeap::new(dev.clone(), &CreateInfo::default()).unwrap());
        let engine = AsyncTransferEngine::new(dev.clone()).unwrap();
        (dev, heap, engine)
    }

    fn dst(heap: &Arc<DeviceHeap>, size: u64) -> Arc<Buffer> {
        Arc::new(
            Buffer::new(
                heap,
                size,
                vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap(),
        )
    }

    #[test]
    fn update_does_not_block() {
        let (dev, heap, mut engine) = setup();
        let buf = dst(&heap, 16);
        let job = TransferJob::buffer_from_bytes(&heap, buf.clone(), &[1; 16], None).unwrap();
        let id = engine.submit(job);
        assert_eq!(engine.job_state(id), JobState::Pending);

        // submits, fence is not signaled yet
        assert_eq!(engine.update().unwrap(), 0);
        assert_eq!(engine.job_state(id), JobState::Submitted);
        assert_eq!(engine.update().unwrap(), 0);
        assert!(!buf.is_loaded());

        dev.signal_fences();
        assert_eq!(engine.update().unwrap(), 1);
        assert_eq!(engine.job_state(id), JobState::Completed);
        assert!(buf.is_loaded());
        assert_eq!(dev.read_buffer(buf.buffer()).unwrap(), vec![1; 16]);
    }

    #[test]
    fn completions_run_in_submission_order() {
        let (_dev, heap, mut engine) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let o = order.clone();
            let job = TransferJob::buffer_from_bytes(
                &heap,
                dst(&heap, 4),
                &[i as u8; 4],
                Some(Box::new(move || o.lock().unwrap().push(i))),
            )
            .unwrap();
            engine.submit(job);
        }

        assert_eq!(engine.wait_idle().unwrap(), 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!engine.has_pending_work());
    }

    #[test]
    fn jobs_queued_while_in_flight_form_the_next_batch() {
        let (dev, heap, mut engine) = setup();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first = TransferJob::buffer_from_bytes(
            &heap,
            dst(&heap, 4),
            &[0; 4],
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        engine.submit(first);
        engine.update().unwrap();

        let second = TransferJob::buffer_from_bytes(&heap, dst(&heap, 4), &[0; 4], None).unwrap();
        let id = engine.submit(second);
        engine.update().unwrap();
        assert_eq!(engine.job_state(id), JobState::Pending);
        assert_eq!(engine.in_flight_count(), 1);

        dev.signal_fences();
        assert_eq!(engine.update().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.job_state(id), JobState::Submitted);
        assert_eq!(engine.batches_submitted(), 2);
        assert_eq!(dev.submissions().len(), 2);
    }

    #[test]
    fn short_stream_fails_before_submit() {
        let (_dev, heap, engine) = setup();
        let mut src = std::io::Cursor::new(vec![0u8; 10]);

        assert!(TransferJob::buffer(&heap, dst(&heap, 64), &mut src, 4, 32, None).is_err());
        assert!(!engine.has_pending_work());
    }
}
