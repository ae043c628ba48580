//! The G1 collector engine.
//!
//! A cycle runs under the GC lock. Depending on its cause it goes through:
//!
//! ```text
//! young/mixed: pause[ select CS ─ MarkYoung ─ CollectYoungAndMove ─ update refs ─ actualize remsets ]
//!              then, for marking causes:
//!              pause[ InitialMark ] ─ Mark (concurrent) ─ pause[ Remark ─ Sweep ]
//! full:        pause[ young CS ─ whole-heap Mark ─ Sweep ─ tenured compaction, one region per CS ]
//! ```
//!
//! Every pause first flushes the mutators' card buffers and digests all
//! pending cards, so remembered sets are complete while the mutators are
//! stopped. Young regions are never sources in remembered sets: they are part
//! of every young and mixed collection set and are traced directly.
//!
//! Objects surviving a collection-set region are either copied into tenured
//! regions (the old copy keeps a forwarding pointer until the region is freed)
//! or, for dense young regions, promoted in place. Humongous objects never move.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use super::barrier::G1BarrierSet;
use super::collection_set::CollectionSet;
use super::marker::Marker;
use super::safepoint::{Rendezvous, SafepointGuard};
use super::sync::{LockGuard, LockOrder};
use super::task::{GcCollectionType, GcPhase, GcTask, GcTaskCause};
use super::update_remset::{UpdateRemsetPause, UpdateRemsetWorker};
use super::workers::GcWorkers;
use crate::config::GcSettings;
use crate::error::GcError;
use crate::heap::nonmovable::Reclaimed;
use crate::heap::object_allocator::G1ObjectAllocator;
use crate::heap::pool::RegionPool;
use crate::heap::region::{Region, RegionFlags, RegionId, SpaceType};
use crate::heap::region_allocator::{ObjectStatus, RegionKind};
use crate::mem_stats::{GenerationalMemStats, GenerationalSnapshot, HeapMemStats};
use crate::metrics::{GcHistory, GcMetrics, PhaseTimer};
use crate::mutator::MutatorState;
use crate::object::ObjectRef;
#[cfg(feature = "tracing")]
use crate::tracing::internal;

/// Embedder roots outside mutator handles.
///
/// Each slot holds zero or the address of an object. The collector reads the
/// slots while marking and rewrites them when their objects move, always with
/// the mutators stopped.
pub trait RootProvider: Send + Sync {
    /// Calls `visitor` once for every root slot.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize));
}

/// Observer of collection cycles. All hooks default to no-ops.
///
/// Hooks run on the collecting thread while it holds the GC lock; they must
/// not request a collection.
pub trait GcListener: Send + Sync {
    /// A cycle starts.
    fn gc_started(&self, _task: &GcTask, _heap_used: usize) {}
    /// A cycle finished; `task.collection_type` says what it did.
    fn gc_finished(&self, _task: &GcTask, _metrics: &GcMetrics) {}
    /// A phase starts.
    fn gc_phase_started(&self, _phase: GcPhase) {}
    /// A phase finished.
    fn gc_phase_finished(&self, _phase: GcPhase) {}
}

/// Survivors and region fates of one collect-and-move phase.
#[derive(Default)]
struct Evacuation {
    /// Objects whose slots must be rewritten: copies, promoted survivors and
    /// surviving humongous objects.
    survivors: Vec<ObjectRef>,
    promoted: Vec<RegionId>,
    freed_humongous: Vec<RegionId>,
}

#[derive(Default)]
struct Cycle {
    metrics: GcMetrics,
    timer: PhaseTimer,
}

impl Cycle {
    fn reclaimed(&mut self, reclaimed: Reclaimed) {
        self.metrics.objects_reclaimed += reclaimed.objects;
        self.metrics.bytes_reclaimed += reclaimed.bytes;
    }
}

/// A stop-the-world pause with card digestion suspended.
struct Pause<'a> {
    remset: UpdateRemsetPause<'a>,
    _safepoint: SafepointGuard<'a>,
    started: Instant,
}

/// The collector of one heap.
pub struct G1Gc {
    settings: GcSettings,
    allocator: G1ObjectAllocator,
    barrier: Arc<G1BarrierSet>,
    update_remset: Arc<UpdateRemsetWorker>,
    rendezvous: Rendezvous,
    workers: GcWorkers,
    mutators: Mutex<Vec<Arc<MutatorState>>>,
    roots: Mutex<Vec<Arc<dyn RootProvider>>>,
    listeners: Mutex<Vec<Arc<dyn GcListener>>>,
    /// Nonmovable and humongous objects allocated while marking runs.
    newobj_buffer: Mutex<Vec<ObjectRef>>,
    gc_lock: Mutex<()>,
    interrupt: AtomicBool,
    phase: AtomicU8,
    mixed_pending: AtomicBool,
    concurrent_mark_pending: AtomicBool,
    /// Bumped by every collection of the young regions.
    young_epoch: AtomicUsize,
    /// Tenured regions in use after the last whole-heap marking.
    last_mark_tenured: AtomicUsize,
    gen_stats: GenerationalMemStats,
    mem_stats: Arc<HeapMemStats>,
    history: GcHistory,
    task_sender: Mutex<Option<Sender<GcTask>>>,
}

impl G1Gc {
    /// Reserves the heap and starts the update-remset thread if enabled.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidSettings`], [`GcError::Map`] if the heap
    /// cannot be reserved, or [`GcError::Spawn`].
    pub fn new(settings: GcSettings) -> Result<Self, GcError> {
        settings.validate()?;
        let mem_stats = Arc::new(HeapMemStats::new());
        let allocator = G1ObjectAllocator::new(&settings, Arc::clone(&mem_stats))?;
        let pool = Arc::clone(allocator.pool());
        let barrier = Arc::new(G1BarrierSet::new(
            Arc::clone(&pool),
            settings.min_concurrent_cards_to_process,
        ));
        let update_remset = Arc::new(UpdateRemsetWorker::new(pool, Arc::clone(&barrier)));
        if settings.concurrent_update_remset {
            update_remset.start().map_err(GcError::Spawn)?;
        }
        Ok(Self {
            workers: GcWorkers::new(settings.effective_workers()),
            settings,
            allocator,
            barrier,
            update_remset,
            rendezvous: Rendezvous::new(),
            mutators: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            newobj_buffer: Mutex::new(Vec::new()),
            gc_lock: Mutex::new(()),
            interrupt: AtomicBool::new(false),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            mixed_pending: AtomicBool::new(false),
            concurrent_mark_pending: AtomicBool::new(false),
            young_epoch: AtomicUsize::new(0),
            last_mark_tenured: AtomicUsize::new(0),
            gen_stats: GenerationalMemStats::new(),
            mem_stats,
            history: GcHistory::new(),
            task_sender: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The settings the heap was built with.
    #[must_use]
    pub const fn settings(&self) -> &GcSettings {
        &self.settings
    }

    /// The object allocator.
    #[must_use]
    pub const fn object_allocator(&self) -> &G1ObjectAllocator {
        &self.allocator
    }

    fn pool(&self) -> &RegionPool {
        self.allocator.pool()
    }

    /// The write barrier state.
    #[must_use]
    pub fn barrier(&self) -> &G1BarrierSet {
        &self.barrier
    }

    /// The update-remset worker.
    #[must_use]
    pub fn update_remset(&self) -> &UpdateRemsetWorker {
        &self.update_remset
    }

    pub(crate) const fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Counters of the last cycle.
    #[must_use]
    pub fn stats(&self) -> GenerationalSnapshot {
        self.gen_stats.snapshot()
    }

    /// Cumulative counters.
    #[must_use]
    pub fn mem_stats(&self) -> &HeapMemStats {
        &self.mem_stats
    }

    /// Recent cycles.
    #[must_use]
    pub const fn history(&self) -> &GcHistory {
        &self.history
    }

    /// The phase currently running.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether the last marking left tenured regions worth a mixed collection.
    #[must_use]
    pub fn is_mixed_pending(&self) -> bool {
        self.mixed_pending.load(Ordering::Acquire)
    }

    pub(crate) fn register_mutator(&self, state: Arc<MutatorState>) {
        self.mutators.lock().push(state);
    }

    pub(crate) fn unregister_mutator(&self, state: &Arc<MutatorState>) {
        self.barrier.on_mutator_exit(&state.buffers);
        self.mutators.lock().retain(|m| !Arc::ptr_eq(m, state));
    }

    fn mutators_snapshot(&self) -> Vec<Arc<MutatorState>> {
        self.mutators.lock().clone()
    }

    /// Adds embedder roots.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.roots.lock().push(provider);
    }

    /// Adds a cycle observer.
    pub fn add_listener(&self, listener: Arc<dyn GcListener>) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn set_task_sender(&self, sender: Sender<GcTask>) {
        *self.task_sender.lock() = Some(sender);
    }

    pub(crate) fn task_sender(&self) -> Option<Sender<GcTask>> {
        self.task_sender.lock().clone()
    }

    pub(crate) fn take_task_sender(&self) -> Option<Sender<GcTask>> {
        self.task_sender.lock().take()
    }

    /// Records a nonmovable or humongous object allocated during marking.
    pub(crate) fn record_new_object(&self, obj: ObjectRef) {
        self.newobj_buffer.lock().push(obj);
    }

    /// Asks a running concurrent marking to stop early; the remaining work
    /// is finished in the remark pause.
    ///
    /// Has no effect outside the mark phase.
    pub fn on_wait_for_idle_fail(&self) {
        if self.phase() == GcPhase::Mark {
            self.interrupt.store(true, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------------
    // Cycle driver
    // ------------------------------------------------------------------------

    /// Runs a collection for `task` on the calling thread and returns the task
    /// with its collection type filled in.
    ///
    /// A young request is dropped if the young regions were collected while
    /// the caller waited for the GC lock; its type is then
    /// [`GcCollectionType::None`].
    ///
    /// The calling thread must not be attached as a mutator.
    pub fn wait_for_gc(&self, mut task: GcTask) -> GcTask {
        let seen = self.young_epoch.load(Ordering::Acquire);
        let _order = LockGuard::new(LockOrder::GcRunning);
        let _running = self.gc_lock.lock();
        if task.cause == GcTaskCause::Young && self.young_epoch.load(Ordering::Acquire) != seen {
            return task;
        }
        self.run_phases(&mut task);
        task
    }

    fn run_phases(&self, task: &mut GcTask) {
        let started = Instant::now();
        let listeners = self.listeners.lock().clone();
        self.interrupt.store(false, Ordering::Release);
        self.gen_stats.reset();
        let mut cycle = Cycle::default();
        cycle.metrics.cause = Some(task.cause);

        #[cfg(feature = "tracing")]
        let _span = internal::trace_gc_cycle(internal::next_gc_id(), task.cause);

        for listener in &listeners {
            listener.gc_started(task, self.pool().used_bytes());
        }

        task.collection_type = if task.cause.is_full() {
            self.run_full_gc(&mut cycle)
        } else {
            let collection_type = self.run_young_or_mixed(&mut cycle);
            let pending = self.concurrent_mark_pending.swap(false, Ordering::AcqRel);
            let moved_young = matches!(
                collection_type,
                GcCollectionType::Young | GcCollectionType::Mixed
            );
            if moved_young
                && (task.cause.triggers_concurrent_mark() || pending)
                && !self.interrupt.load(Ordering::Acquire)
            {
                self.run_concurrent_mark(&mut cycle);
            }
            collection_type
        };

        self.finish_cycle(task, cycle, started, &listeners);
        self.check_heap_usage();
    }

    fn finish_cycle(
        &self,
        task: &GcTask,
        mut cycle: Cycle,
        started: Instant,
        listeners: &[Arc<dyn GcListener>],
    ) {
        self.gen_stats.update_heap_stats(&self.mem_stats);
        match task.collection_type {
            GcCollectionType::Young => self.mem_stats.record_young_collection(),
            GcCollectionType::Mixed => self.mem_stats.record_mixed_collection(),
            GcCollectionType::Tenured | GcCollectionType::Full => {
                self.mem_stats.record_full_collection();
            }
            GcCollectionType::None => {}
        }

        let stats = self.gen_stats.snapshot();
        #[cfg(feature = "tracing")]
        internal::log_cycle_stats(task.collection_type, &stats);

        let metrics = &mut cycle.metrics;
        metrics.duration = started.elapsed();
        metrics.collection_type = task.collection_type;
        metrics.objects_reclaimed += stats.young_freed_objects + stats.tenured_freed_objects;
        metrics.bytes_reclaimed += stats.young_freed_bytes + stats.tenured_freed_bytes;
        metrics.objects_moved = stats.young_moved_objects + stats.tenured_moved_objects;
        metrics.bytes_moved = stats.young_moved_bytes + stats.tenured_moved_bytes;
        metrics.mark_duration = cycle.timer.mark;
        metrics.compact_duration = cycle.timer.compact;
        metrics.update_refs_duration = cycle.timer.update_refs;
        metrics.sweep_duration = cycle.timer.sweep;
        self.history.push(cycle.metrics);

        let metrics = self.history.last();
        for listener in listeners {
            listener.gc_finished(task, &metrics);
        }
        self.phase.store(GcPhase::Idle as u8, Ordering::Release);
    }

    /// Queues concurrent marking once tenured occupancy crosses the threshold
    /// and has grown since the last whole-heap marking.
    #[allow(clippy::cast_precision_loss)]
    fn check_heap_usage(&self) {
        let pool = self.pool();
        let tenured = pool.tenured_regions_count();
        let usage = tenured as f64 / pool.max_tenured_regions().max(1) as f64;
        if usage < self.settings.heap_usage_threshold
            || tenured <= self.last_mark_tenured.load(Ordering::Acquire)
        {
            return;
        }
        self.last_mark_tenured.store(tenured, Ordering::Release);
        let queued = self
            .task_sender()
            .is_some_and(|tx| tx.send(GcTask::new(GcTaskCause::HeapUsageThreshold)).is_ok());
        if !queued {
            self.concurrent_mark_pending.store(true, Ordering::Release);
        }
    }

    fn run_phase<R>(&self, phase: GcPhase, f: impl FnOnce() -> R) -> R {
        let listeners = self.listeners.lock().clone();
        self.phase.store(phase as u8, Ordering::Release);
        for listener in &listeners {
            listener.gc_phase_started(phase);
        }
        let result = {
            #[cfg(feature = "tracing")]
            let _span = internal::trace_phase(phase);
            f()
        };
        for listener in &listeners {
            listener.gc_phase_finished(phase);
        }
        self.phase.store(GcPhase::Idle as u8, Ordering::Release);
        result
    }

    fn begin_pause(&self) -> Pause<'_> {
        let safepoint = self.rendezvous.safepoint_begin();
        let started = Instant::now();
        let remset = self.update_remset.pause();
        for mutator in self.mutators_snapshot() {
            self.barrier.flush_cards(&mutator.buffers);
        }
        remset.drain();
        Pause {
            remset,
            _safepoint: safepoint,
            started,
        }
    }

    fn end_pause(&self, pause: Pause<'_>, cycle: &mut Cycle) {
        let elapsed: Duration = pause.started.elapsed();
        self.mem_stats.record_pause(elapsed);
        cycle.metrics.pause_duration += elapsed;
        drop(pause);
    }

    // ------------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------------

    fn visit_root_slots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
        for mutator in self.mutators_snapshot() {
            for slot in mutator.handles.lock().iter() {
                visitor(slot);
            }
        }
        let providers = self.roots.lock().clone();
        for provider in providers {
            provider.visit_roots(visitor);
        }
    }

    fn visit_root_objects(&self, mut f: impl FnMut(ObjectRef)) {
        self.visit_root_slots(&mut |slot| {
            // SAFETY: root slots hold zero or object addresses.
            if let Some(obj) = unsafe { ObjectRef::from_addr(slot.load(Ordering::Acquire)) } {
                f(obj);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Young and mixed collections
    // ------------------------------------------------------------------------

    fn young_collection_set(&self) -> CollectionSet {
        let pool = self.pool();
        let young: Vec<&Region> = self
            .allocator
            .young_regions()
            .into_iter()
            .map(|id| pool.region(id))
            .collect();
        CollectionSet::new(&young)
    }

    #[allow(clippy::cast_precision_loss)]
    fn garbage_rate(region: &Region) -> f64 {
        region.garbage_bytes() as f64 / region.size() as f64
    }

    fn select_collection_set(&self) -> CollectionSet {
        let mut cs = self.young_collection_set();
        if self.mixed_pending.swap(false, Ordering::AcqRel) {
            let pool = self.pool();
            let candidates = self
                .allocator
                .object_allocator()
                .get_top_garbage_regions(self.settings.number_of_mixed_tenured_regions);
            for id in candidates {
                let region = pool.region(id);
                if Self::garbage_rate(region) >= self.settings.region_garbage_rate_threshold {
                    cs.add_region(region);
                }
            }
        }
        #[cfg(feature = "tracing")]
        internal::log_collection_set(cs.young().len(), cs.tenured().len(), cs.humongous().len());
        cs
    }

    fn has_mixed_candidates(&self) -> bool {
        let pool = self.pool();
        self.allocator
            .object_allocator()
            .get_top_garbage_regions(1)
            .into_iter()
            .any(|id| {
                Self::garbage_rate(pool.region(id)) >= self.settings.region_garbage_rate_threshold
            })
    }

    /// Whether the tenured space can absorb every movable region of `cs`.
    ///
    /// Each parallel compaction worker may leave one destination region
    /// partly filled, so one spare region per worker is required.
    fn have_enough_space_to_move(&self, cs: &CollectionSet) -> bool {
        let movable = cs.movable().len();
        if movable == 0 {
            return true;
        }
        let spare = if self.settings.parallel_compacting {
            self.workers.count().min(movable)
        } else {
            1
        };
        self.allocator.have_free_regions(movable + spare)
            && self.allocator.have_tenured_size(movable + spare)
    }

    #[allow(clippy::cast_precision_loss)]
    fn need_to_promote(&self, region: &Region, full: bool) -> bool {
        !full
            && region.is_young()
            && region.live_bytes() as f64 / region.size() as f64
                >= self.settings.promotion_region_alive_rate
    }

    fn run_young_or_mixed(&self, cycle: &mut Cycle) -> GcCollectionType {
        let pause = self.begin_pause();
        let cs = self.select_collection_set();
        let collection_type = if self.have_enough_space_to_move(&cs) {
            let mut collection_type = self.collect_cs(&pause, &cs, false, cycle, &[]);
            if collection_type == GcCollectionType::Mixed {
                self.mixed_pending
                    .store(self.has_mixed_candidates(), Ordering::Release);
            }
            // The next collection of the same size would not fit: compact
            // tenured now, while the young regions are empty.
            if !self.have_enough_space_to_move(&cs) {
                #[cfg(feature = "tracing")]
                internal::log_full_fallback("too few free regions left for the next collection");
                self.run_full_for_tenured(&pause, cycle);
                collection_type = GcCollectionType::Full;
            }
            collection_type
        } else {
            #[cfg(feature = "tracing")]
            internal::log_full_fallback("not enough free regions to evacuate the collection set");
            self.run_full_for_tenured(&pause, cycle);
            GcCollectionType::Tenured
        };
        self.end_pause(pause, cycle);
        collection_type
    }

    /// Marks, evacuates and frees the regions of `cs`.
    ///
    /// `young_sources` are live young objects that may point into `cs`; young
    /// regions are never remembered-set sources, so they are passed in when
    /// tenured regions are evacuated while young regions exist.
    fn collect_cs(
        &self,
        pause: &Pause<'_>,
        cs: &CollectionSet,
        full: bool,
        cycle: &mut Cycle,
        young_sources: &[ObjectRef],
    ) -> GcCollectionType {
        let pool = self.pool();
        for id in cs.all() {
            let region = pool.region(*id);
            region.add_flag(RegionFlags::IS_COLLECTION_SET);
            region.mark_bitmap().clear();
        }
        cycle.metrics.collection_set_regions += cs.len();

        cycle.timer.start();
        let remset_objects = self.run_phase(GcPhase::MarkYoung, || self.mixed_mark(cs, young_sources));
        cycle.timer.end_mark();
        for id in cs.young() {
            let region = pool.region(*id);
            region.set_live_bytes(region.calc_mark_bytes());
        }

        cycle.timer.start();
        let evacuation = self.run_phase(GcPhase::CollectYoungAndMove, || {
            self.collect_and_move(cs, full)
        });
        cycle.timer.end_compact();
        cycle.metrics.promoted_regions += evacuation.promoted.len();

        cycle.timer.start();
        self.update_refs_to_moved_objects(&evacuation.survivors, &remset_objects);
        cycle.timer.end_update_refs();

        self.actualize_remsets(pause, cs, &evacuation, cycle);
        if cs.tenured().is_empty() {
            GcCollectionType::Young
        } else {
            GcCollectionType::Mixed
        }
    }

    /// Marks the collection set from the roots and the remembered sets.
    ///
    /// Returns the objects found through remembered-set cards; their slots
    /// are rewritten once the collection set is evacuated.
    fn mixed_mark(&self, cs: &CollectionSet, young_sources: &[ObjectRef]) -> Vec<ObjectRef> {
        let marker = Marker::new(self.pool(), |region: &Region| region.is_in_collection_set());
        let mut stack = Vec::new();
        self.visit_root_objects(|obj| {
            marker.mark_object(obj, &mut stack);
        });
        let mut remset_objects = self.cache_remset_objects(cs);
        remset_objects.extend_from_slice(young_sources);
        for obj in &remset_objects {
            marker.mark_refs_of(*obj, &mut stack);
        }
        self.drain(&marker, stack);
        remset_objects
    }

    /// Live objects of every card recorded in the remembered sets of `cs`,
    /// each card visited once.
    fn cache_remset_objects(&self, cs: &CollectionSet) -> Vec<ObjectRef> {
        let pool = self.pool();
        let table = pool.card_table();
        let mut objects = Vec::new();
        for id in cs.all() {
            pool.region(*id)
                .rem_set()
                .proceed_marked_cards(|from, card| {
                    let source = pool.region(from);
                    if source.is_free() || source.is_young() || source.is_in_collection_set() {
                        return;
                    }
                    if !table.set_processed(card) {
                        return;
                    }
                    let (start, end) = table.memory_range(card);
                    source.iterate_over_live_objects_in_range(start, end, |obj| objects.push(obj));
                });
        }
        objects
    }

    fn drain<F>(&self, marker: &Marker<'_, F>, mut stack: Vec<ObjectRef>)
    where
        F: Fn(&Region) -> bool + Sync,
    {
        if self.settings.parallel_marking {
            marker.drain_parallel(&self.workers, stack);
        } else {
            marker.drain(&mut stack);
        }
    }

    fn collect_and_move(&self, cs: &CollectionSet, full: bool) -> Evacuation {
        let pool = self.pool();
        let (promote, compact): (Vec<RegionId>, Vec<RegionId>) = cs
            .movable()
            .iter()
            .copied()
            .partition(|id| self.need_to_promote(pool.region(*id), full));

        let mut evacuation = Evacuation::default();
        for id in &promote {
            self.promote_region(pool.region(*id), &mut evacuation.survivors);
        }
        evacuation.promoted = promote;

        if self.settings.parallel_compacting {
            let lists = self.workers.for_each(&compact, |id, out| {
                self.compact_region::<true>(pool.region(*id), out);
            });
            evacuation.survivors.extend(lists.into_iter().flatten());
        } else {
            for id in &compact {
                self.compact_region::<false>(pool.region(*id), &mut evacuation.survivors);
            }
        }

        for id in cs.humongous() {
            let region = pool.region(*id);
            let mut alive = false;
            region.iterate_over_objects(|obj| {
                if region.is_marked(obj) {
                    alive = true;
                    evacuation.survivors.push(obj);
                }
            });
            if !alive {
                evacuation.freed_humongous.push(*id);
            }
        }
        evacuation
    }

    /// Promotes a dense young region in place. Every object of the region
    /// counts as moved; the dead ones are freed later as tenured garbage.
    fn promote_region(&self, region: &Region, survivors: &mut Vec<ObjectRef>) {
        #[cfg(feature = "tracing")]
        internal::log_promotion(region.id(), region.live_bytes());
        let (mut count, mut bytes) = (0, 0);
        let mut account = |obj: ObjectRef| {
            count += 1;
            bytes += obj.size();
        };
        if self.settings.track_freed_objects {
            region.iterate_over_objects(&mut account);
        } else {
            region.iterate_over_marked_objects(&mut account);
        }
        self.gen_stats.record_young_moved::<false>(count, bytes);
        self.allocator.object_allocator().promote_young_region(
            region,
            true,
            |_| ObjectStatus::Alive,
            |obj| survivors.push(obj),
        );
    }

    fn compact_region<const ATOMIC: bool>(&self, region: &Region, survivors: &mut Vec<ObjectRef>) {
        let young = region.is_young();
        let use_marked_bitmap = !self.settings.track_freed_objects;
        let (mut freed_objects, mut freed_bytes) = (0, 0);
        let (mut moved_objects, mut moved_bytes) = (0, 0);
        self.allocator.object_allocator().compact_specific_region(
            region,
            use_marked_bitmap,
            |obj| {
                if region.is_marked(obj) {
                    ObjectStatus::Alive
                } else {
                    freed_objects += 1;
                    freed_bytes += obj.size();
                    ObjectStatus::Dead
                }
            },
            |from, to| {
                from.set_forwarded(to);
                moved_objects += 1;
                moved_bytes += to.size();
                survivors.push(to);
            },
        );
        if use_marked_bitmap {
            // Dead objects were not visited; only their bytes are known.
            freed_bytes = region.allocated_bytes().saturating_sub(moved_bytes);
        }
        if young {
            self.gen_stats
                .record_young_freed::<ATOMIC>(freed_objects, freed_bytes);
            self.gen_stats
                .record_young_moved::<ATOMIC>(moved_objects, moved_bytes);
        } else {
            self.gen_stats
                .record_tenured_freed::<ATOMIC>(freed_objects, freed_bytes);
            self.gen_stats
                .record_tenured_moved::<ATOMIC>(moved_objects, moved_bytes);
        }
    }

    fn update_refs_to_moved_objects(&self, survivors: &[ObjectRef], remset_objects: &[ObjectRef]) {
        self.visit_root_slots(&mut |slot| {
            // SAFETY: root slots hold zero or object addresses.
            let Some(obj) = (unsafe { ObjectRef::from_addr(slot.load(Ordering::Acquire)) }) else {
                return;
            };
            if let Some(to) = obj.forwarded() {
                slot.store(to.addr(), Ordering::Release);
            }
        });

        let pool = self.pool();
        let update = |obj: &ObjectRef, _: &mut Vec<()>| update_object_refs(pool, *obj);
        if self.settings.parallel_compacting {
            self.workers.for_each(survivors, update);
            self.workers.for_each(remset_objects, update);
        } else {
            for obj in survivors.iter().chain(remset_objects) {
                update_object_refs(pool, *obj);
            }
        }
    }

    /// Returns evacuated regions to the pool and drops every trace of them
    /// from the remembered sets and the card queue.
    fn actualize_remsets(
        &self,
        pause: &Pause<'_>,
        cs: &CollectionSet,
        evacuation: &Evacuation,
        cycle: &mut Cycle,
    ) {
        let pool = self.pool();
        let freed: Vec<&Region> = cs
            .all()
            .iter()
            .filter(|id| {
                !evacuation.promoted.contains(id)
                    && (!pool.region(**id).is_humongous()
                        || evacuation.freed_humongous.contains(id))
            })
            .map(|id| pool.region(*id))
            .collect();
        pause.remset.invalidate_regions(&freed);
        let freed_tenured: Vec<RegionId> = cs
            .tenured()
            .iter()
            .chain(&evacuation.freed_humongous)
            .copied()
            .collect();
        pool.invalidate_rem_sets(&freed_tenured);

        if !cs.young().is_empty() {
            for mutator in self.mutators_snapshot() {
                *mutator.tlab.lock() = None;
            }
            self.allocator.reset_young_allocator();
            self.young_epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.allocator
            .object_allocator()
            .reset_several_specific_regions(cs.tenured());
        for id in &evacuation.freed_humongous {
            let region = pool.region(*id);
            let bytes = region.size();
            self.mem_stats.record_freed(SpaceType::Humongous, 1, bytes);
            cycle.reclaimed(Reclaimed { objects: 1, bytes });
            self.allocator.humongous_allocator().space().free_region(region);
        }
        for id in cs.all() {
            let region = pool.region(*id);
            if !region.is_free() {
                region.rm_flag(RegionFlags::IS_COLLECTION_SET);
            }
        }
        pool.card_table().clear_all();
    }

    // ------------------------------------------------------------------------
    // Whole-heap marking, sweep and full collections
    // ------------------------------------------------------------------------

    fn mark_whole_heap(&self) {
        let pool = self.pool();
        pool.iterate_regions(|region| region.mark_bitmap().clear());
        let marker = Marker::new(pool, |_: &Region| true);
        let mut stack = Vec::new();
        self.visit_root_objects(|obj| {
            marker.mark_object(obj, &mut stack);
        });
        self.drain(&marker, stack);
    }

    /// Frees unmarked nonmovable and humongous objects and makes the mark
    /// bitmap of every tenured region its live bitmap.
    fn sweep(&self, pause: &Pause<'_>, cycle: &mut Cycle) {
        let pool = self.pool();
        let mut freed = Vec::new();
        let (nonmovable, humongous) = self.allocator.collect_non_regular_regions(
            |obj| {
                if pool.object_region(obj).is_marked(obj) {
                    ObjectStatus::Alive
                } else {
                    ObjectStatus::Dead
                }
            },
            |region| {
                pause.remset.invalidate_regions(&[region]);
                freed.push(region.id());
            },
        );
        pool.invalidate_rem_sets(&freed);
        cycle.reclaimed(nonmovable);
        cycle.reclaimed(humongous);

        pool.iterate_regions(|region| {
            if region.is_old() || region.is_nonmovable() {
                region.set_live_bytes(region.calc_mark_bytes());
                region.swap_mark_bitmap();
            }
        });
        // Partly filled evacuation destinations become mixed candidates.
        self.allocator
            .object_allocator()
            .clear_current_region(RegionKind::Old);
        self.last_mark_tenured
            .store(pool.tenured_regions_count(), Ordering::Release);
    }

    fn full_marking(&self, pause: &Pause<'_>, cycle: &mut Cycle) {
        cycle.timer.start();
        self.run_phase(GcPhase::Mark, || self.mark_whole_heap());
        cycle.timer.end_mark();
        cycle.timer.start();
        self.run_phase(GcPhase::Sweep, || self.sweep(pause, cycle));
        cycle.timer.end_sweep();
        self.mixed_pending.store(false, Ordering::Release);
    }

    /// Live objects of the young regions, as found by the last whole-heap
    /// marking.
    fn young_live_objects(&self) -> Vec<ObjectRef> {
        let pool = self.pool();
        let mut objects = Vec::new();
        for id in self.allocator.young_regions() {
            pool.region(id)
                .iterate_over_marked_objects(|obj| objects.push(obj));
        }
        objects
    }

    /// Evacuates tenured regions one at a time, most garbage first, until
    /// only garbage-free regions are left or the pool runs out of space.
    fn compact_tenured(&self, pause: &Pause<'_>, cycle: &mut Cycle) {
        let pool = self.pool();
        let young_sources = self.young_live_objects();
        let candidates = self
            .allocator
            .object_allocator()
            .get_top_garbage_regions(usize::MAX);
        for id in candidates {
            let region = pool.region(id);
            if region.garbage_bytes() == 0 {
                break;
            }
            let mut cs = CollectionSet::default();
            cs.add_region(region);
            if !self.have_enough_space_to_move(&cs) {
                #[cfg(feature = "tracing")]
                internal::log_full_fallback("tenured compaction stopped: no free regions");
                break;
            }
            self.collect_cs(pause, &cs, true, cycle, &young_sources);
        }
    }

    /// Whole-heap marking and sweep followed by tenured compaction.
    fn run_full_for_tenured(&self, pause: &Pause<'_>, cycle: &mut Cycle) {
        self.full_marking(pause, cycle);
        self.compact_tenured(pause, cycle);
    }

    fn run_full_gc(&self, cycle: &mut Cycle) -> GcCollectionType {
        let pause = self.begin_pause();
        let young = self.young_collection_set();
        let young_collected = self.have_enough_space_to_move(&young);
        if young_collected {
            self.collect_cs(&pause, &young, true, cycle, &[]);
        } else {
            #[cfg(feature = "tracing")]
            internal::log_full_fallback("not enough free regions to evacuate the young regions");
        }
        self.run_full_for_tenured(&pause, cycle);
        self.end_pause(pause, cycle);

        if young_collected {
            GcCollectionType::Full
        } else {
            GcCollectionType::Tenured
        }
    }

    // ------------------------------------------------------------------------
    // Concurrent marking
    // ------------------------------------------------------------------------

    fn run_concurrent_mark(&self, cycle: &mut Cycle) {
        cycle.metrics.concurrent_mark = true;
        let pool = self.pool();
        let marker = Marker::new(pool, |_: &Region| true);

        let pause = self.begin_pause();
        cycle.timer.start();
        let mut stack = self.run_phase(GcPhase::InitialMark, || {
            pool.iterate_regions(|region| region.mark_bitmap().clear());
            self.newobj_buffer.lock().clear();
            self.barrier.set_concurrent_marking(true);
            let mut stack = Vec::new();
            self.visit_root_objects(|obj| {
                marker.mark_object(obj, &mut stack);
            });
            stack
        });
        cycle.timer.end_mark();
        self.end_pause(pause, cycle);

        let started = Instant::now();
        let completed = self.run_phase(GcPhase::Mark, || {
            marker.drain_interruptible(&mut stack, &self.interrupt)
        });
        cycle.metrics.concurrent_mark_duration = started.elapsed();

        // An interrupted drain leaves its stack to the remark pause.
        let pause = self.begin_pause();
        cycle.timer.start();
        self.run_phase(GcPhase::Remark, || {
            let mutators = self.mutators_snapshot();
            for mutator in &mutators {
                self.barrier.flush_satb(&mutator.buffers);
            }
            for buffer in self.barrier.take_satb_buffers() {
                for obj in buffer {
                    marker.mark_object(obj, &mut stack);
                }
            }
            for obj in std::mem::take(&mut *self.newobj_buffer.lock()) {
                marker.mark_object(obj, &mut stack);
            }
            self.visit_root_objects(|obj| {
                marker.mark_object(obj, &mut stack);
            });
            self.drain(&marker, stack);
        });
        self.barrier.set_concurrent_marking(false);
        cycle.timer.end_mark();

        if !completed {
            cycle.metrics.interrupted = true;
            #[cfg(feature = "tracing")]
            internal::log_mark_interrupted();
        }
        cycle.timer.start();
        self.run_phase(GcPhase::Sweep, || self.sweep(&pause, cycle));
        cycle.timer.end_sweep();
        self.mixed_pending
            .store(self.has_mixed_candidates(), Ordering::Release);
        self.mem_stats.record_concurrent_mark();
        self.end_pause(pause, cycle);
    }
}

impl Drop for G1Gc {
    fn drop(&mut self) {
        self.update_remset.stop();
    }
}

/// Rewrites the slots of `obj` that point to evacuated objects and records
/// every cross-region reference in the target's remembered set.
fn update_object_refs(pool: &RegionPool, obj: ObjectRef) {
    for index in 0..obj.ref_count() {
        let Some(target) = obj.load_ref(index) else {
            continue;
        };
        let target = match target.forwarded() {
            Some(to) => {
                obj.store_ref_raw(index, Some(to));
                to
            }
            None => target,
        };
        debug_assert!(
            pool.get_region(target.addr()).is_none_or(|region| {
                !region.is_in_collection_set()
                    || region.is_humongous()
                    || region.has_flag(RegionFlags::IS_PROMOTED)
            }),
            "reference to {target:?} was not forwarded"
        );
        pool.add_ref_with_addr(obj, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::object_allocator::AllocationKind;
    use crate::test_util::{small_settings, SlotRoots, SMALL_REGION};

    fn alloc(gc: &G1Gc, refs: usize, kind: AllocationKind) -> ObjectRef {
        gc.object_allocator()
            .allocate(refs, 16, kind)
            .map(|(obj, _)| obj)
            .unwrap()
    }

    #[test]
    fn test_young_gc_moves_rooted_objects() {
        let gc = G1Gc::new(small_settings(64)).unwrap();
        let roots = Arc::new(SlotRoots::new(1));
        gc.add_root_provider(roots.clone());

        let head = alloc(&gc, 1, AllocationKind::Movable);
        let tail = alloc(&gc, 0, AllocationKind::Movable);
        head.store_ref_raw(0, Some(tail));
        for _ in 0..100 {
            alloc(&gc, 0, AllocationKind::Movable);
        }
        roots.set(0, Some(head));

        let task = gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
        assert_eq!(task.collection_type, GcCollectionType::Young);

        let head = roots.get(0).unwrap();
        assert!(gc.object_allocator().region_of(head).is_old());
        let tail = head.load_ref(0).unwrap();
        assert!(gc.object_allocator().region_of(tail).is_old());

        let stats = gc.stats();
        assert_eq!(stats.young_moved_objects, 2);
        assert_eq!(stats.young_freed_objects, 100);
        assert_eq!(gc.object_allocator().pool().young_regions_count(), 0);
    }

    #[test]
    fn test_old_to_young_reference_survives_via_remset() {
        let gc = G1Gc::new(small_settings(64)).unwrap();
        let holder = alloc(&gc, 1, AllocationKind::NonMovable);
        let roots = Arc::new(SlotRoots::new(1));
        roots.set(0, Some(holder));
        gc.add_root_provider(roots);
        let young = alloc(&gc, 0, AllocationKind::Movable);

        let buffers = crate::gc::barrier::BarrierBuffers::new();
        holder.store_ref_raw(0, Some(young));
        assert!(gc.barrier().post_write_barrier(&buffers, holder, Some(young)));
        gc.barrier().flush_cards(&buffers);

        // The young object is reachable only through the holder's card.
        gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
        let moved = holder.load_ref(0).unwrap();
        assert_ne!(moved, young);
        let region = gc.object_allocator().region_of(moved);
        assert!(region.is_old());
        assert!(region
            .rem_set()
            .contains_region(gc.object_allocator().region_of(holder).id()));
    }

    #[test]
    fn test_full_gc_sweeps_nonmovable_and_humongous() {
        let gc = G1Gc::new(small_settings(64)).unwrap();
        alloc(&gc, 0, AllocationKind::NonMovable);
        let (big, _) = gc
            .object_allocator()
            .allocate(0, 2 * SMALL_REGION, AllocationKind::Movable)
            .unwrap();
        assert!(gc.object_allocator().region_of(big).is_humongous());

        let task = gc.wait_for_gc(GcTask::new(GcTaskCause::Explicit));
        assert_eq!(task.collection_type, GcCollectionType::Full);
        assert!(gc.object_allocator().all_regions().is_empty());
        assert_eq!(gc.mem_stats().freed_objects(SpaceType::NonMovable), 1);
        assert_eq!(gc.mem_stats().freed_objects(SpaceType::Humongous), 1);
        assert_eq!(gc.history().last().collection_type, GcCollectionType::Full);
    }

    #[test]
    fn test_concurrent_mark_measures_tenured_liveness() {
        let gc = G1Gc::new(GcSettings {
            promotion_region_alive_rate: 2.0,
            ..small_settings(64)
        })
        .unwrap();
        let roots = Arc::new(SlotRoots::new(4));
        gc.add_root_provider(roots.clone());

        let mut kept = Vec::new();
        for i in 0..400 {
            let obj = alloc(&gc, 0, AllocationKind::Movable);
            if i % 100 == 0 {
                kept.push(obj);
            }
        }
        for (index, obj) in kept.iter().enumerate() {
            roots.set(index, Some(*obj));
        }
        gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
        let tenured = gc.object_allocator().region_of(roots.get(0).unwrap()).id();

        for index in 1..4 {
            roots.set(index, None);
        }
        let task = gc.wait_for_gc(GcTask::new(GcTaskCause::HeapUsageThreshold));
        assert_eq!(task.collection_type, GcCollectionType::Young);
        assert!(gc.history().last().concurrent_mark);
        assert_eq!(gc.mem_stats().concurrent_marks(), 1);
        let region = gc.object_allocator().pool().region(tenured);
        assert_eq!(region.live_bytes(), roots.get(0).unwrap().size());
        assert!(!gc.barrier().is_concurrent_marking());
        assert_eq!(gc.phase(), GcPhase::Idle);
    }

    #[test]
    fn test_tenured_compaction_with_young_regions_in_place() {
        let gc = G1Gc::new(GcSettings {
            promotion_region_alive_rate: 2.0,
            heap_usage_threshold: 1.0,
            region_garbage_rate_threshold: 1.0,
            parallel_compacting: false,
            ..small_settings(16)
        })
        .unwrap();
        let roots = Arc::new(SlotRoots::new(1));
        gc.add_root_provider(roots.clone());
        let pool = gc.object_allocator().pool();

        // A rooted list that grows by about one tenured region per round.
        for _ in 0..20 {
            if pool.tenured_regions_count() >= 8 {
                break;
            }
            for _ in 0..60 {
                let (node, _) = gc
                    .object_allocator()
                    .allocate(1, 1000, AllocationKind::Movable)
                    .unwrap();
                node.store_ref_raw(0, roots.get(0));
                roots.set(0, Some(node));
            }
            let task = gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
            assert_eq!(task.collection_type, GcCollectionType::Young);
        }
        assert!(pool.tenured_regions_count() >= 8);

        // Keep one tenured node, reachable only from a young object.
        let mut keeper = roots.get(0).unwrap();
        for _ in 0..30 {
            keeper = keeper.load_ref(0).unwrap();
        }
        keeper.store_ref_raw(0, None);
        // SAFETY: the payload holds 1000 bytes.
        unsafe { keeper.payload().cast::<u64>().write_unaligned(0xabcd) };
        let holder = alloc(&gc, 1, AllocationKind::Movable);
        holder.store_ref_raw(0, Some(keeper));
        roots.set(0, Some(holder));
        while gc
            .object_allocator()
            .allocate(0, 1000, AllocationKind::Movable)
            .is_some()
        {}
        assert_eq!(pool.young_regions_count(), 4);

        // The young regions cannot be evacuated; tenured is compacted around them.
        let task = gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
        assert_eq!(task.collection_type, GcCollectionType::Tenured);
        assert_eq!(pool.young_regions_count(), 4);
        assert_eq!(pool.tenured_regions_count(), 1);
        assert_eq!(roots.get(0), Some(holder));
        let moved = holder.load_ref(0).unwrap();
        assert_ne!(moved, keeper);
        assert!(gc.object_allocator().region_of(moved).is_old());
        // SAFETY: as above.
        assert_eq!(unsafe { moved.payload().cast::<u64>().read_unaligned() }, 0xabcd);

        // Now the young regions fit again.
        let task = gc.wait_for_gc(GcTask::new(GcTaskCause::Young));
        assert_eq!(task.collection_type, GcCollectionType::Young);
        let holder = roots.get(0).unwrap();
        assert!(gc.object_allocator().region_of(holder).is_old());
        let kept = holder.load_ref(0).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { kept.payload().cast::<u64>().read_unaligned() }, 0xabcd);
    }

    #[test]
    fn test_interrupt_outside_mark_is_ignored() {
        let gc = G1Gc::new(small_settings(16)).unwrap();
        gc.on_wait_for_idle_fail();
        assert!(!gc.interrupt.load(Ordering::Acquire));
    }
}
