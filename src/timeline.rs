//! Single-threaded cooperative scheduler.
//!
//! The timeline owns the event list, the simulated clock and the registered
//! entities. Entities never call each other: all interaction goes through
//! scheduled events, and a running handler may only mutate its own state and
//! schedule more events through the [`Context`] it is handed. There are no
//! suspension points inside a handler: "wait for a reply" means returning and
//! letting the reply arrive as its own event.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        Arc,
    },
    thread::{sleep, JoinHandle},
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::event::{EntityId, Event, EventId, EventList, Time};

/// A unit of simulation behavior. One `init` at timeline initialization, then
/// one `on_event` per delivered event, run to completion before the next.
pub trait Entity<M> {
    fn init(&mut self, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_event(&mut self, event: M, ctx: &mut Context<'_, M>) -> anyhow::Result<()>;
}

// shared handles so a driver can keep inspecting an entity after the run.
// the kernel dispatches one event at a time, so the borrow can never be
// contended from inside the timeline
impl<M, T: Entity<M>> Entity<M> for Rc<RefCell<T>> {
    fn init(&mut self, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        self.borrow_mut().init(ctx)
    }

    fn on_event(&mut self, event: M, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        self.borrow_mut().on_event(event, ctx)
    }
}

#[derive(Debug)]
struct Scheduler<M> {
    time: Time,
    stop_time: Time,
    events: EventList<M>,
    event_counter: u64,
    rng: StdRng,
    progress: Option<Arc<ProgressInner>>,
}

impl<M> Scheduler<M> {
    fn schedule(&mut self, event: Event<M>) -> anyhow::Result<EventId> {
        anyhow::ensure!(
            event.time >= self.time,
            "event for entity {} scheduled in the past: {} < {}",
            event.target,
            event.time,
            self.time
        );
        self.event_counter += 1;
        Ok(self.events.push(event))
    }

    fn stop(&mut self) {
        self.stop_time = self.time;
        if let Some(progress) = &self.progress {
            progress.stop_time.store(self.stop_time, Relaxed)
        }
    }
}

/// Scheduling capability handed to a running entity. Grants access to the
/// clock, the event list and the timeline RNG, never to other entities.
pub struct Context<'a, M> {
    scheduler: &'a mut Scheduler<M>,
    id: EntityId,
    name: &'a str,
}

impl<M> Context<'_, M> {
    pub fn now(&self) -> Time {
        self.scheduler.time
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Name the entity was registered under, for diagnostics.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn schedule(
        &mut self,
        delay: Time,
        target: EntityId,
        message: impl Into<M>,
    ) -> anyhow::Result<EventId> {
        self.schedule_at(self.now() + delay, target, message)
    }

    pub fn schedule_at(
        &mut self,
        time: Time,
        target: EntityId,
        message: impl Into<M>,
    ) -> anyhow::Result<EventId> {
        self.scheduler.schedule(Event {
            time,
            target,
            message: message.into(),
        })
    }

    pub fn remove_event(&mut self, id: EventId) -> anyhow::Result<()> {
        self.scheduler
            .events
            .remove(id)
            .map(|_| ())
            .ok_or(anyhow::anyhow!("no scheduled event {id}"))
    }

    pub fn update_event_time(&mut self, id: EventId, time: Time) -> anyhow::Result<EventId> {
        anyhow::ensure!(time >= self.now(), "cannot reschedule event {id} into the past");
        self.scheduler
            .events
            .update_time(id, time)
            .ok_or(anyhow::anyhow!("no scheduled event {id}"))
    }

    /// Exit the run loop before the next event fires.
    pub fn stop(&mut self) {
        self.scheduler.stop()
    }

    /// Timeline-wide deterministic RNG, seeded through [`Timeline::seed`].
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.scheduler.rng
    }
}

struct Slot<M> {
    name: String,
    entity: Option<Box<dyn Entity<M>>>,
}

/// The simulation timeline: clock, event list and entity registry.
///
/// Entities are wired in two phases because they reference each other
/// cyclically (protocol peers, oracle parents): [`Timeline::register`]
/// reserves a named id, [`Timeline::install`] binds the entity once every id
/// it needs exists.
pub struct Timeline<M> {
    scheduler: Scheduler<M>,
    entities: Vec<Slot<M>>,
    names: FxHashMap<String, EntityId>,
    initialized: bool,
    is_running: bool,
}

impl<M> Default for Timeline<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Timeline<M> {
    pub fn new() -> Self {
        Self::with_stop_time(Time::MAX)
    }

    pub fn with_stop_time(stop_time: Time) -> Self {
        Self {
            scheduler: Scheduler {
                time: 0,
                stop_time,
                events: Default::default(),
                event_counter: 0,
                rng: StdRng::seed_from_u64(0),
                progress: None,
            },
            entities: Default::default(),
            names: Default::default(),
            initialized: false,
            is_running: false,
        }
    }

    pub fn now(&self) -> Time {
        self.scheduler.time
    }

    pub fn stop(&mut self) {
        self.scheduler.stop()
    }

    /// Extend (or shorten) the stop time, e.g. to resume a stopped run.
    pub fn set_stop_time(&mut self, stop_time: Time) {
        self.scheduler.stop_time = stop_time;
        if let Some(progress) = &self.scheduler.progress {
            progress.stop_time.store(stop_time, Relaxed)
        }
    }

    /// Deterministically reseed every random source the timeline owns.
    pub fn seed(&mut self, seed: u64) {
        self.scheduler.rng = StdRng::seed_from_u64(seed)
    }

    pub fn event_counter(&self) -> u64 {
        self.scheduler.event_counter
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.events.len()
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Reserve a uniquely-named entity slot.
    pub fn register(&mut self, name: impl Into<String>) -> anyhow::Result<EntityId> {
        let name = name.into();
        anyhow::ensure!(
            !self.names.contains_key(&name),
            "duplicate entity name {name:?}"
        );
        let id = self.entities.len();
        self.names.insert(name.clone(), id);
        self.entities.push(Slot { name, entity: None });
        Ok(id)
    }

    /// Bind an entity to a reserved slot.
    pub fn install(&mut self, id: EntityId, entity: impl Entity<M> + 'static) -> anyhow::Result<()> {
        let slot = self
            .entities
            .get_mut(id)
            .ok_or(anyhow::anyhow!("unknown entity id {id}"))?;
        anyhow::ensure!(slot.entity.is_none(), "entity {:?} already installed", slot.name);
        slot.entity = Some(Box::new(entity));
        Ok(())
    }

    /// Register + install in one step, for entities without cyclic wiring.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        entity: impl Entity<M> + 'static,
    ) -> anyhow::Result<EntityId> {
        let id = self.register(name)?;
        self.install(id, entity)?;
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<EntityId> {
        self.names.get(name).copied()
    }

    pub fn schedule(
        &mut self,
        time: Time,
        target: EntityId,
        message: impl Into<M>,
    ) -> anyhow::Result<EventId> {
        self.scheduler.schedule(Event {
            time,
            target,
            message: message.into(),
        })
    }

    pub fn remove_event(&mut self, id: EventId) -> anyhow::Result<()> {
        self.scheduler
            .events
            .remove(id)
            .map(|_| ())
            .ok_or(anyhow::anyhow!("no scheduled event {id}"))
    }

    pub fn update_event_time(&mut self, id: EventId, time: Time) -> anyhow::Result<EventId> {
        anyhow::ensure!(time >= self.now(), "cannot reschedule event {id} into the past");
        self.scheduler
            .events
            .update_time(id, time)
            .ok_or(anyhow::anyhow!("no scheduled event {id}"))
    }

    /// Initialize every installed entity, exactly once, in registration
    /// order. Initialization may itself schedule events.
    pub fn init(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.initialized, "timeline already initialized");
        self.initialized = true;
        for id in 0..self.entities.len() {
            self.dispatch(id, |entity, ctx| entity.init(ctx))?
        }
        Ok(())
    }

    /// Drive the simulation until the event list drains or the next event
    /// reaches the stop time. An event at the stop time is left at the head
    /// of the list, so a later `run` resumes with it.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.is_running = true;
        if let Some(progress) = &self.scheduler.progress {
            progress.running.store(true, Relaxed)
        }
        let result = self.run_loop();
        self.is_running = false;
        if let Some(progress) = &self.scheduler.progress {
            progress.running.store(false, Relaxed)
        }
        result
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        loop {
            match self.scheduler.events.peek() {
                None => return Ok(()),
                Some(event) if event.time >= self.scheduler.stop_time => return Ok(()),
                Some(_) => {}
            }
            let Some(event) = self.scheduler.events.pop() else {
                // unreachable, the peek above saw an event
                return Ok(());
            };
            anyhow::ensure!(
                self.scheduler.time <= event.time,
                "event time regressed for entity {:?}",
                self.entities.get(event.target).map(|slot| &slot.name)
            );
            self.scheduler.time = event.time;
            if let Some(progress) = &self.scheduler.progress {
                progress.time.store(event.time, Relaxed)
            }
            self.dispatch(event.target, |entity, ctx| entity.on_event(event.message, ctx))?
        }
    }

    fn dispatch<T>(
        &mut self,
        id: EntityId,
        invoke: impl FnOnce(&mut Box<dyn Entity<M>>, &mut Context<'_, M>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let slot = self
            .entities
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown entity id {id}"))?;
        let mut entity = slot
            .entity
            .take()
            .ok_or_else(|| anyhow::anyhow!("entity never installed in slot {id}"))?;
        let name = self.entities[id].name.as_str();
        debug!(entity = name, time = self.scheduler.time, "dispatch");
        let mut ctx = Context {
            scheduler: &mut self.scheduler,
            id,
            name,
        };
        let result = invoke(&mut entity, &mut ctx);
        self.entities[id].entity = Some(entity);
        result
    }

    /// Read-only progress handle for a separate display thread. The handle
    /// observes the clock through atomics and never touches the event list.
    pub fn progress(&mut self) -> Progress {
        let inner = self.scheduler.progress.get_or_insert_with(|| {
            Arc::new(ProgressInner {
                time: AtomicU64::new(self.scheduler.time),
                stop_time: AtomicU64::new(self.scheduler.stop_time),
                running: AtomicBool::new(false),
            })
        });
        Progress(inner.clone())
    }
}

#[derive(Debug)]
struct ProgressInner {
    time: AtomicU64,
    stop_time: AtomicU64,
    running: AtomicBool,
}

/// Snapshot view of a running timeline, safe to poll from another thread.
#[derive(Debug, Clone)]
pub struct Progress(Arc<ProgressInner>);

impl Progress {
    pub fn time(&self) -> Time {
        self.0.time.load(Relaxed)
    }

    pub fn stop_time(&self) -> Option<Time> {
        match self.0.stop_time.load(Relaxed) {
            Time::MAX => None,
            time => Some(time),
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Relaxed)
    }

    /// Spawn a thread that renders the simulated clock every `interval`
    /// until the run finishes.
    pub fn display_every(self, interval: Duration) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while self.is_running() {
                let stop = match self.stop_time() {
                    Some(time) => human_time(time),
                    None => "NaN".into(),
                };
                eprint!("\rsimulation time: {} / {stop}", human_time(self.time()));
                sleep(interval)
            }
        })
    }
}

/// Render picoseconds the way a human reads a simulation trace.
pub fn human_time(time: Time) -> String {
    let mut nanosec = time as f64 / 1e3;
    if nanosec < 1e6 {
        return format!("{nanosec:.0} ns");
    }
    let ms = nanosec / 1e6;
    nanosec %= 1e6;
    if ms < 1e3 {
        return format!("{ms:.0} ms, {nanosec:.2} ns");
    }
    let second = ms / 1e3;
    if second < 60.0 {
        return format!("{second:.2} sec");
    }
    let minute = (second / 60.0).floor();
    let second = second % 60.0;
    if minute < 60.0 {
        return format!("{minute:.0} min: {second:.2} sec");
    }
    let hour = (minute / 60.0).floor();
    let minute = minute % 60.0;
    format!("{hour:.0} hour: {minute:.0} min: {second:.2} sec")
}
