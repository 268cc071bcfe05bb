// This file is part of Loess.
//
// Loess is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Loess is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Loess.  If not, see <http://www.gnu.org/licenses/>.

// The transactional CPU->GPU transfer queue. Callers open a transaction
// against a new or existing resource, attach data packets, and poll for
// completion; worker threads pull the packet bytes off-thread and the
// render thread lands the staged copies once per frame in `tick`.
//
// Threading: every non-`immediate` operation is non-blocking and callable
// from any thread; the queue serializes internally. Jobs are routed to a
// fixed worker per target resource so that writes against one resource
// stage in submission order. No ordering is promised across resources.

use crate::{
    descriptor::{PartialResource, ResourceDesc},
    device::{CommandContext, Device, FenceValue},
    locator::ResourceLocator,
    packet::DataPacket,
    pool::ResourcePool,
};
use anyhow::Result;
use bitflags::bitflags;
use crossbeam::channel::{unbounded, Receiver, Sender};
use fxhash::FxHashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

bitflags! {
    pub struct TransactionFlags: u32 {
        /// Skip pool reuse and force a fresh device allocation.
        const FORCE_CREATE = 1 << 0;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransactionStatus {
    Pending,
    Staged,
    Committed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UploadConfig {
    pub worker_count: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { worker_count: 2 }
    }
}

struct Transaction {
    status: TransactionStatus,
    // Create transactions own their descriptor until the resource exists.
    desc: Option<ResourceDesc>,
    created: bool,
    force_create: bool,
    locator: Option<ResourceLocator>,
    // Staging jobs handed to workers and not yet landed in a tick.
    outstanding: u32,
    fence: Option<FenceValue>,
}

struct StageJob {
    tid: TransactionId,
    packet: Box<dyn DataPacket>,
    region: PartialResource,
}

struct StagedResult {
    tid: TransactionId,
    region: PartialResource,
    row_pitch: u32,
    bytes: Result<Vec<u8>>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    transactions: FxHashMap<TransactionId, Transaction>,
}

pub struct UploadQueue {
    device: Arc<dyn Device>,
    pool: Arc<ResourcePool>,
    state: Mutex<QueueState>,
    job_txs: Mutex<Vec<Sender<StageJob>>>,
    staged_rx: Receiver<StagedResult>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    last_frame: AtomicU64,
}

impl UploadQueue {
    pub fn new(device: Arc<dyn Device>, pool: Arc<ResourcePool>, config: UploadConfig) -> Arc<Self> {
        let worker_count = config.worker_count.max(1);
        let (staged_tx, staged_rx) = unbounded::<StagedResult>();
        let mut job_txs = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (job_tx, job_rx) = unbounded::<StageJob>();
            let staged_tx = staged_tx.clone();
            job_txs.push(job_tx);
            workers.push(
                thread::Builder::new()
                    .name(format!("upload-stage-{}", worker_index))
                    .spawn(move || stage_worker(job_rx, staged_tx))
                    .expect("spawned staging worker"),
            );
        }
        Arc::new(Self {
            device,
            pool,
            state: Mutex::new(QueueState::default()),
            job_txs: Mutex::new(job_txs),
            staged_rx,
            workers: Mutex::new(workers),
            last_frame: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Open a transaction that creates a new resource, optionally seeded
    /// with initial data for the base subresource.
    pub fn begin_create(
        &self,
        desc: ResourceDesc,
        packet: Option<Box<dyn DataPacket>>,
        flags: TransactionFlags,
    ) -> Result<TransactionId> {
        self.device.validate(&desc)?;
        let tid = self.alloc_id();
        let outstanding = u32::from(packet.is_some());
        self.state.lock().transactions.insert(
            tid,
            Transaction {
                status: TransactionStatus::Pending,
                desc: Some(desc),
                created: true,
                force_create: flags.contains(TransactionFlags::FORCE_CREATE),
                locator: None,
                outstanding,
                fence: None,
            },
        );
        if let Some(packet) = packet {
            self.route_job(StageJob {
                tid,
                packet,
                region: PartialResource::whole(),
            });
        }
        trace!("upload: begin_create -> {:?}", tid);
        Ok(tid)
    }

    /// Open a transaction against an existing resource for partial updates.
    pub fn begin_update(&self, locator: &ResourceLocator) -> TransactionId {
        let tid = self.alloc_id();
        self.state.lock().transactions.insert(
            tid,
            Transaction {
                status: TransactionStatus::Pending,
                desc: None,
                created: false,
                force_create: false,
                locator: Some(locator.clone()),
                outstanding: 0,
                fence: None,
            },
        );
        trace!("upload: begin_update -> {:?}", tid);
        tid
    }

    /// Schedule a subresource or sub-box copy onto the transaction target.
    pub fn update_data(
        &self,
        tid: TransactionId,
        packet: Box<dyn DataPacket>,
        region: PartialResource,
    ) {
        {
            let mut state = self.state.lock();
            let txn = state
                .transactions
                .get_mut(&tid)
                .unwrap_or_else(|| panic!("update_data on unknown transaction {:?}", tid));
            assert!(
                !txn.status.is_terminal(),
                "update_data on finished transaction {:?}",
                tid
            );
            txn.outstanding += 1;
        }
        self.route_job(StageJob {
            tid,
            packet,
            region,
        });
    }

    /// Cheap and non-blocking; once true it stays true until `end`.
    pub fn is_completed(&self, tid: TransactionId) -> bool {
        let state = self.state.lock();
        let txn = state
            .transactions
            .get(&tid)
            .unwrap_or_else(|| panic!("is_completed on unknown transaction {:?}", tid));
        txn.status.is_terminal()
    }

    pub fn status_of(&self, tid: TransactionId) -> Option<TransactionStatus> {
        self.state.lock().transactions.get(&tid).map(|t| t.status)
    }

    /// The created or attached resource; defined only after commit.
    pub fn resource_of(&self, tid: TransactionId) -> Option<ResourceLocator> {
        let state = self.state.lock();
        let txn = state.transactions.get(&tid)?;
        if txn.status == TransactionStatus::Committed {
            txn.locator.clone()
        } else {
            None
        }
    }

    /// Cancel at any time; idempotent. A cancelled transaction still wants
    /// exactly one `end`.
    pub fn cancel(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        if let Some(txn) = state.transactions.get_mut(&tid) {
            match txn.status {
                TransactionStatus::Committed | TransactionStatus::Cancelled => {}
                _ => {
                    txn.status = TransactionStatus::Cancelled;
                    if txn.created {
                        // Dropping our only handle sends the allocation back
                        // to the pool or frees it.
                        txn.locator = None;
                    }
                    debug!("upload: cancelled {:?}", tid);
                }
            }
        }
    }

    /// Release transaction bookkeeping. Must be called exactly once, after
    /// `is_completed` returns true or after `cancel`.
    pub fn end(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        let txn = state
            .transactions
            .remove(&tid)
            .unwrap_or_else(|| panic!("transaction {:?} ended twice or never begun", tid));
        assert!(
            txn.status.is_terminal(),
            "transaction {:?} ended while still in flight",
            tid
        );
    }

    /// Synchronous create + upload on the caller thread. The only effect on
    /// shared state is the existence of the returned resource; use it for
    /// cold-start paths where the stall is acceptable.
    pub fn immediate(
        &self,
        desc: ResourceDesc,
        packet: &mut dyn DataPacket,
    ) -> Result<ResourceLocator> {
        self.device.validate(&desc)?;
        let resource = self.device.create_resource(&desc)?;
        let mut ctx = self.device.begin_commands();
        let subs = sub_resources_of(&desc);
        for sub in subs {
            let pitches = packet.pitches(sub);
            let bytes = packet.take(sub)?;
            ctx.copy_bytes_to_resource(resource.clone(), sub, None, pitches.row, bytes);
        }
        let fence = self.device.submit(ctx);
        self.device.wait_fence(fence);
        Ok(ResourceLocator::new_unpooled(resource))
    }

    /// Advance the pipeline one frame: land staged copies, submit them, and
    /// retire fenced work. Called once per frame from the render thread.
    pub fn tick(&self, frame: u64) {
        self.last_frame.store(frame, Ordering::Relaxed);

        let mut arrivals = Vec::new();
        while let Ok(result) = self.staged_rx.try_recv() {
            arrivals.push(result);
        }

        let mut ctx: Option<Box<dyn CommandContext>> = None;
        let mut staged_tids = Vec::new();
        {
            let mut state = self.state.lock();
            for result in arrivals {
                let txn = match state.transactions.get_mut(&result.tid) {
                    Some(txn) => txn,
                    // Cancelled and already ended; drop the bytes.
                    None => continue,
                };
                txn.outstanding -= 1;
                if txn.status == TransactionStatus::Cancelled {
                    continue;
                }
                let bytes = match result.bytes {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("upload: {:?} source failed: {:#}", result.tid, err);
                        txn.status = TransactionStatus::Cancelled;
                        if txn.created {
                            txn.locator = None;
                        }
                        continue;
                    }
                };
                if txn.locator.is_none() {
                    match self.materialize(txn) {
                        Ok(locator) => txn.locator = Some(locator),
                        Err(err) => {
                            warn!("upload: {:?} create failed: {:#}", result.tid, err);
                            txn.status = TransactionStatus::Cancelled;
                            continue;
                        }
                    }
                }
                let target = txn.locator.as_ref().expect("materialized").resource().clone();
                ctx.get_or_insert_with(|| self.device.begin_commands())
                    .copy_bytes_to_resource(
                        target,
                        result.region.sub,
                        result.region.dst_box,
                        result.row_pitch,
                        bytes,
                    );
                txn.status = TransactionStatus::Staged;
                staged_tids.push(result.tid);
            }
        }

        if let Some(ctx) = ctx {
            let fence = self.device.submit(ctx);
            let mut state = self.state.lock();
            for tid in staged_tids {
                if let Some(txn) = state.transactions.get_mut(&tid) {
                    txn.fence = Some(txn.fence.map_or(fence, |f| f.max(fence)));
                }
            }
        }

        {
            let mut state = self.state.lock();
            let mut failed = Vec::new();
            for (&tid, txn) in state.transactions.iter_mut() {
                match txn.status {
                    TransactionStatus::Pending
                        if txn.created && txn.outstanding == 0 && txn.fence.is_none() =>
                    {
                        // Create with no data: the zero-initialized resource
                        // is complete as soon as it exists.
                        if txn.locator.is_none() {
                            match self.materialize(txn) {
                                Ok(locator) => txn.locator = Some(locator),
                                Err(err) => {
                                    warn!("upload: {:?} create failed: {:#}", tid, err);
                                    failed.push(tid);
                                    continue;
                                }
                            }
                        }
                        txn.status = TransactionStatus::Committed;
                    }
                    TransactionStatus::Staged if txn.outstanding == 0 => {
                        if let Some(fence) = txn.fence {
                            if self.device.fence_completed(fence) {
                                txn.status = TransactionStatus::Committed;
                                trace!("upload: committed {:?}", tid);
                            }
                        }
                    }
                    _ => {}
                }
            }
            for tid in failed {
                if let Some(txn) = state.transactions.get_mut(&tid) {
                    txn.status = TransactionStatus::Cancelled;
                }
            }
        }

        self.pool.reap(frame);
    }

    /// Drain the queue to empty. Blocks; shutdown and load screens only.
    pub fn flush(&self) {
        loop {
            self.tick(self.last_frame.load(Ordering::Relaxed));
            let state = self.state.lock();
            let open = state.transactions.values().any(|txn| {
                txn.outstanding > 0
                    || txn.status == TransactionStatus::Staged
                    || (txn.status == TransactionStatus::Pending && txn.created)
            });
            drop(state);
            if !open {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn open_transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn alloc_id(&self) -> TransactionId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        TransactionId(id)
    }

    fn materialize(&self, txn: &Transaction) -> Result<ResourceLocator> {
        let desc = txn.desc.as_ref().expect("create transaction has desc");
        if !txn.force_create {
            if let Some(locator) = self.pool.acquire(desc) {
                return Ok(locator);
            }
        }
        let resource = self.device.create_resource(desc)?;
        Ok(ResourceLocator::new_pooled(
            resource,
            &self.pool,
            desc.signature_hash(),
        ))
    }

    fn route_job(&self, job: StageJob) {
        let txns = self.job_txs.lock();
        // Per-target routing: all jobs of one transaction stage on one
        // worker, so per-resource submission order survives.
        let key = job.tid.raw() as usize % txns.len();
        txns[key].send(job).expect("staging workers alive");
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        self.job_txs.lock().clear();
        for handle in self.workers.lock().drain(..) {
            handle.join().ok();
        }
    }
}

fn stage_worker(job_rx: Receiver<StageJob>, staged_tx: Sender<StagedResult>) {
    for mut job in job_rx.iter() {
        let row_pitch = job.packet.pitches(job.region.sub).row;
        let bytes = job.packet.take(job.region.sub);
        // The queue may already be gone during shutdown.
        staged_tx
            .send(StagedResult {
                tid: job.tid,
                region: job.region,
                row_pitch,
                bytes,
            })
            .ok();
    }
}

fn sub_resources_of(desc: &ResourceDesc) -> Vec<crate::descriptor::SubResource> {
    use crate::descriptor::SubResource;
    match desc.texture_shape() {
        None => vec![SubResource::base()],
        Some(shape) => {
            let mut subs = Vec::new();
            for mip in 0..shape.mip_count as u32 {
                for layer in 0..shape.layer_count() {
                    subs.push(SubResource { mip, layer });
                }
            }
            subs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{BindFlags, SampleFormat, SubResource},
        packet::{BasicPacket, FailingPacket, TexturePitches},
        pool::PoolConfig,
        software::SoftwareDevice,
    };

    fn queue() -> Arc<UploadQueue> {
        let device = SoftwareDevice::new();
        let pool = ResourcePool::new(PoolConfig::default());
        UploadQueue::new(device, pool, UploadConfig::default())
    }

    fn pump(queue: &UploadQueue, tid: TransactionId) {
        for frame in 0..1000 {
            queue.tick(frame);
            if queue.is_completed(tid) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("transaction {:?} never completed", tid);
    }

    fn buffer_desc(byte_count: u64) -> ResourceDesc {
        ResourceDesc::linear_buffer(byte_count, BindFlags::SHADER_RESOURCE, "test-buffer")
    }

    #[test]
    fn test_create_with_data_commits() {
        let queue = queue();
        let payload = (0u8..64).collect::<Vec<u8>>();
        let tid = queue
            .begin_create(
                buffer_desc(64),
                Some(Box::new(BasicPacket::new(
                    payload.clone(),
                    TexturePitches::new(64, 64),
                ))),
                TransactionFlags::empty(),
            )
            .unwrap();
        assert!(!queue.is_completed(tid));
        pump(&queue, tid);
        assert_eq!(queue.status_of(tid), Some(TransactionStatus::Committed));
        let locator = queue.resource_of(tid).expect("committed resource");
        let bytes = queue
            .device()
            .read_back(locator.resource(), SubResource::base())
            .unwrap();
        assert_eq!(bytes, payload);
        queue.end(tid);
        assert_eq!(queue.open_transaction_count(), 0);
    }

    #[test]
    fn test_failing_packet_cancels_and_recovers() {
        let queue = queue();
        let tid = queue
            .begin_create(
                buffer_desc(1024),
                Some(Box::new(FailingPacket)),
                TransactionFlags::empty(),
            )
            .unwrap();
        pump(&queue, tid);
        assert_eq!(queue.status_of(tid), Some(TransactionStatus::Cancelled));
        assert!(queue.resource_of(tid).is_none());
        queue.end(tid);

        // A fresh transaction against the same descriptor works.
        let tid = queue
            .begin_create(
                buffer_desc(1024),
                Some(Box::new(BasicPacket::new(
                    vec![9u8; 1024],
                    TexturePitches::new(1024, 1024),
                ))),
                TransactionFlags::empty(),
            )
            .unwrap();
        pump(&queue, tid);
        let locator = queue.resource_of(tid).unwrap();
        let bytes = queue
            .device()
            .read_back(locator.resource(), SubResource::base())
            .unwrap();
        assert_eq!(bytes, vec![9u8; 1024]);
        queue.end(tid);
    }

    #[test]
    fn test_cancel_is_idempotent_and_requires_end() {
        let queue = queue();
        let tid = queue
            .begin_create(buffer_desc(16), None, TransactionFlags::empty())
            .unwrap();
        queue.cancel(tid);
        queue.cancel(tid);
        assert!(queue.is_completed(tid));
        queue.end(tid);
    }

    #[test]
    #[should_panic(expected = "ended twice")]
    fn test_double_end_panics() {
        let queue = queue();
        let tid = queue
            .begin_create(buffer_desc(16), None, TransactionFlags::empty())
            .unwrap();
        queue.tick(0);
        queue.end(tid);
        queue.end(tid);
    }

    #[test]
    fn test_immediate_purity() {
        let queue = queue();
        let payload = (0u8..32).rev().collect::<Vec<u8>>();
        let mut packet = BasicPacket::new(payload.clone(), TexturePitches::new(32, 32));
        let before = queue.pool().pooled_count();
        let locator = queue.immediate(buffer_desc(32), &mut packet).unwrap();
        let bytes = queue
            .device()
            .read_back(locator.resource(), SubResource::base())
            .unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(queue.open_transaction_count(), 0);
        assert_eq!(queue.pool().pooled_count(), before);
    }

    #[test]
    fn test_pool_reuse_after_locator_drop() {
        let queue = queue();
        let tid = queue
            .begin_create(buffer_desc(256), None, TransactionFlags::empty())
            .unwrap();
        queue.tick(0);
        let locator = queue.resource_of(tid).unwrap();
        queue.end(tid);
        drop(locator);
        assert_eq!(queue.pool().pooled_count(), 1);

        let tid = queue
            .begin_create(buffer_desc(256), None, TransactionFlags::empty())
            .unwrap();
        queue.tick(1);
        assert!(queue.is_completed(tid));
        assert_eq!(queue.pool().pooled_count(), 0);
        let locator = queue.resource_of(tid).unwrap();
        queue.end(tid);

        // FORCE_CREATE skips the shelf.
        drop(locator);
        assert_eq!(queue.pool().pooled_count(), 1);
        let tid = queue
            .begin_create(buffer_desc(256), None, TransactionFlags::FORCE_CREATE)
            .unwrap();
        queue.tick(2);
        assert_eq!(queue.pool().pooled_count(), 1);
        queue.end(tid);
    }

    #[test]
    fn test_update_existing_resource_with_box() {
        let queue = queue();
        let desc = ResourceDesc::texture_2d(
            4,
            4,
            SampleFormat::R8Unorm,
            BindFlags::SHADER_RESOURCE | BindFlags::TRANSFER_DST,
            "tex",
        );
        let tid = queue
            .begin_create(desc, None, TransactionFlags::empty())
            .unwrap();
        queue.tick(0);
        let locator = queue.resource_of(tid).unwrap();
        queue.end(tid);

        let tid = queue.begin_update(&locator);
        queue.update_data(
            tid,
            Box::new(BasicPacket::new(vec![5u8; 4], TexturePitches::new(2, 4))),
            PartialResource::boxed(
                SubResource::base(),
                crate::descriptor::Box2d::new([2, 2], [4, 4]),
            ),
        );
        pump(&queue, tid);
        queue.end(tid);

        let bytes = queue
            .device()
            .read_back(locator.resource(), SubResource::base())
            .unwrap();
        assert_eq!(bytes[2 * 4 + 2], 5);
        assert_eq!(bytes[3 * 4 + 3], 5);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn test_flush_drains_everything() {
        let queue = queue();
        let mut tids = Vec::new();
        for i in 0..16 {
            tids.push(
                queue
                    .begin_create(
                        buffer_desc(64 + i),
                        Some(Box::new(BasicPacket::new(
                            vec![i as u8; 64 + i as usize],
                            TexturePitches::new(64 + i as u32, 64 + i as u32),
                        ))),
                        TransactionFlags::empty(),
                    )
                    .unwrap(),
            );
        }
        queue.flush();
        for tid in tids {
            assert!(queue.is_completed(tid));
            queue.end(tid);
        }
    }
}
