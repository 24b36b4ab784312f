//! A fixed-timestep game loop driven by a host scheduler.
//!
//! Each scheduled frame measures the elapsed time (capped at
//! [`GameLoopConfig::max_elapsed`]), scales it by the speed factor and runs as many whole
//! simulation steps as fit. The leftover fraction of a step is handed to the render callback
//! as the interpolation alpha.
//!
//! The loop knows nothing about the network. The step callback is where the caller consults
//! [`DeterministicFrameState`](crate::DeterministicFrameState) before executing a frame.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use fortress_lockstep::{GameLoop, GameLoopConfig, ManualScheduler};
//! use web_time::Duration;
//!
//! let steps = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&steps);
//! let config = GameLoopConfig { simulation_hz: 10, ..GameLoopConfig::default() };
//! let mut game_loop = GameLoop::new(
//!     ManualScheduler::new(),
//!     config,
//!     move |frame| sink.borrow_mut().push(frame),
//!     |_alpha| {},
//! )
//! .unwrap();
//!
//! game_loop.start();
//! game_loop.scheduler_mut().advance(Duration::from_millis(250));
//! assert_eq!(game_loop.tick(), 2);
//! assert_eq!(*steps.borrow(), vec![1, 2]);
//! ```

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::{GameLoopConfig, LockstepError};

/// Identifies a requested frame so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameHandle(u64);

impl FrameHandle {
    /// Creates a handle from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// The host's clock and frame scheduling.
///
/// A requested frame is delivered by the host calling [`GameLoop::on_frame`] with its handle.
pub trait FrameScheduler {
    /// The current time.
    fn now(&self) -> Instant;

    /// Asks for one frame callback.
    fn request_frame(&mut self) -> FrameHandle;

    /// Withdraws a requested frame. Unknown handles are ignored.
    fn cancel_frame(&mut self, handle: FrameHandle);
}

/// A scheduler whose clock only moves when told to. For tests and replays.
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    origin: Instant,
    offset: Duration,
    next_handle: u64,
    pending: BTreeSet<FrameHandle>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    /// Creates a scheduler at an arbitrary origin with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Duration::ZERO,
            next_handle: 0,
            pending: BTreeSet::new(),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.offset = self.offset.saturating_add(by);
    }

    /// Removes and returns the oldest pending frame.
    pub fn fire(&mut self) -> Option<FrameHandle> {
        self.pending.pop_first()
    }

    /// True if `handle` was requested and neither fired nor cancelled.
    #[must_use]
    pub fn is_pending(&self, handle: FrameHandle) -> bool {
        self.pending.contains(&handle)
    }

    /// Number of pending frames.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl FrameScheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.offset
    }

    fn request_frame(&mut self) -> FrameHandle {
        self.next_handle += 1;
        let handle = FrameHandle(self.next_handle);
        self.pending.insert(handle);
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        self.pending.remove(&handle);
    }
}

/// A scheduler on the real clock. The host decides when to deliver frames, typically once per
/// display refresh or after sleeping for one simulation step.
#[derive(Debug, Clone, Default)]
pub struct SystemScheduler {
    next_handle: u64,
    pending: Option<FrameHandle>,
}

impl SystemScheduler {
    /// Creates a scheduler with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame waiting for delivery.
    #[must_use]
    pub const fn pending(&self) -> Option<FrameHandle> {
        self.pending
    }
}

impl FrameScheduler for SystemScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn request_frame(&mut self) -> FrameHandle {
        self.next_handle += 1;
        let handle = FrameHandle(self.next_handle);
        self.pending = Some(handle);
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        if self.pending == Some(handle) {
            self.pending = None;
        }
    }
}

type StepCallback = Box<dyn FnMut(u64)>;
type RenderCallback = Box<dyn FnMut(f64)>;

/// Fixed-timestep scheduler with interpolation alpha.
pub struct GameLoop<S: FrameScheduler> {
    scheduler: S,
    dt: Duration,
    max_elapsed: Duration,
    speed: f64,
    paused: bool,
    accumulator: Duration,
    last_time: Option<Instant>,
    frame: u64,
    pending: Option<FrameHandle>,
    on_step: StepCallback,
    on_render: RenderCallback,
}

impl<S: FrameScheduler + fmt::Debug> fmt::Debug for GameLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameLoop")
            .field("scheduler", &self.scheduler)
            .field("dt", &self.dt)
            .field("speed", &self.speed)
            .field("paused", &self.paused)
            .field("accumulator", &self.accumulator)
            .field("frame", &self.frame)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<S: FrameScheduler> GameLoop<S> {
    /// Creates a stopped loop. `on_step` receives the number of each simulated frame, starting
    /// at 1; `on_render` receives the interpolation alpha in `[0, 1)`.
    pub fn new(
        scheduler: S,
        config: GameLoopConfig,
        on_step: impl FnMut(u64) + 'static,
        on_render: impl FnMut(f64) + 'static,
    ) -> Result<Self, LockstepError> {
        config.validate()?;
        Ok(Self {
            scheduler,
            dt: config.simulation_dt(),
            max_elapsed: config.max_elapsed,
            speed: config.speed,
            paused: false,
            accumulator: Duration::ZERO,
            last_time: None,
            frame: 0,
            pending: None,
            on_step: Box::new(on_step),
            on_render: Box::new(on_render),
        })
    }

    /// Starts the clock and requests the first frame. Does nothing if already running.
    pub fn start(&mut self) {
        if self.pending.is_some() {
            return;
        }
        debug!("Game loop started at frame {}", self.frame);
        self.last_time = Some(self.scheduler.now());
        self.pending = Some(self.scheduler.request_frame());
    }

    /// Cancels the pending frame. A stale delivery of it is ignored.
    pub fn stop(&mut self) {
        if let Some(handle) = self.pending.take() {
            debug!("Game loop stopped at frame {}", self.frame);
            self.scheduler.cancel_frame(handle);
        }
        self.last_time = None;
    }

    /// True between [`Self::start`] and [`Self::stop`].
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.pending.is_some()
    }

    /// Delivers the pending frame, if any. Returns the number of simulation steps run.
    pub fn tick(&mut self) -> u32 {
        match self.pending {
            Some(handle) => self.on_frame(handle),
            None => 0,
        }
    }

    /// Runs the frame identified by `handle`, then requests the next one. Handles other than
    /// the pending one are ignored. Returns the number of simulation steps run.
    pub fn on_frame(&mut self, handle: FrameHandle) -> u32 {
        if self.pending != Some(handle) {
            trace!("Ignoring stale frame {:?}", handle);
            return 0;
        }
        self.pending = None;
        self.scheduler.cancel_frame(handle);

        let now = self.scheduler.now();
        let last = self.last_time.replace(now).unwrap_or(now);
        let elapsed = now.saturating_duration_since(last).min(self.max_elapsed);

        let mut steps = 0;
        if !self.paused {
            let scaled = Duration::try_from_secs_f64(elapsed.as_secs_f64() * self.speed)
                .unwrap_or(self.max_elapsed);
            self.accumulator = self.accumulator.saturating_add(scaled);
            while self.accumulator >= self.dt {
                self.accumulator -= self.dt;
                self.frame += 1;
                steps += 1;
                (self.on_step)(self.frame);
            }
        }
        let alpha = self.alpha();
        trace!("Tick: {} steps, alpha {:.3}", steps, alpha);
        (self.on_render)(alpha);

        self.pending = Some(self.scheduler.request_frame());
        steps
    }

    /// Fraction of a step accumulated but not yet simulated.
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.accumulator.as_nanos() as f64 / self.dt.as_nanos().max(1) as f64
    }

    /// Number of simulation steps run so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Suspends or resumes stepping. Rendering continues while paused.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// True while paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Changes the speed factor.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), LockstepError> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(LockstepError::InvalidRequest {
                info: format!("speed must be a finite, non-negative factor, got {}", speed),
            });
        }
        self.speed = speed;
        Ok(())
    }

    /// The scheduler.
    pub const fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// The scheduler, mutably. Used to advance a [`ManualScheduler`].
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    struct Recorder {
        steps: Rc<RefCell<Vec<u64>>>,
        alphas: Rc<RefCell<Vec<f64>>>,
    }

    fn looped(hz: u32) -> (GameLoop<ManualScheduler>, Recorder) {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let alphas = Rc::new(RefCell::new(Vec::new()));
        let step_sink = Rc::clone(&steps);
        let alpha_sink = Rc::clone(&alphas);
        let config = GameLoopConfig {
            simulation_hz: hz,
            ..GameLoopConfig::default()
        };
        let game_loop = GameLoop::new(
            ManualScheduler::new(),
            config,
            move |frame| step_sink.borrow_mut().push(frame),
            move |alpha| alpha_sink.borrow_mut().push(alpha),
        )
        .unwrap();
        (game_loop, Recorder { steps, alphas })
    }

    #[test]
    fn quarter_second_at_ten_hz_runs_two_steps() {
        let (mut game_loop, rec) = looped(10);
        game_loop.start();
        game_loop.scheduler_mut().advance(Duration::from_millis(250));
        assert_eq!(game_loop.tick(), 2);
        assert_eq!(*rec.steps.borrow(), vec![1, 2]);
        assert_eq!(*rec.alphas.borrow(), vec![0.5]);
        assert_eq!(game_loop.frame(), 2);
    }

    #[test]
    fn elapsed_time_is_capped() {
        let (mut game_loop, rec) = looped(10);
        game_loop.start();
        game_loop.scheduler_mut().advance(Duration::from_secs(30));
        assert_eq!(game_loop.tick(), 2);
        assert_eq!(rec.steps.borrow().len(), 2);
    }

    #[test]
    fn leftover_time_carries_over() {
        let (mut game_loop, rec) = looped(10);
        game_loop.start();
        game_loop.scheduler_mut().advance(Duration::from_millis(60));
        assert_eq!(game_loop.tick(), 0);
        game_loop.scheduler_mut().advance(Duration::from_millis(60));
        assert_eq!(game_loop.tick(), 1);
        assert_eq!(*rec.steps.borrow(), vec![1]);
        assert!((game_loop.alpha() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn paused_loop_renders_without_stepping() {
        let (mut game_loop, rec) = looped(10);
        game_loop.start();
        game_loop.set_paused(true);
        game_loop.scheduler_mut().advance(Duration::from_millis(250));
        assert_eq!(game_loop.tick(), 0);
        assert!(rec.steps.borrow().is_empty());
        assert_eq!(rec.alphas.borrow().len(), 1);
    }

    #[test]
    fn speed_scales_elapsed_time() {
        let (mut game_loop, _rec) = looped(10);
        game_loop.set_speed(2.0).unwrap();
        game_loop.start();
        game_loop.scheduler_mut().advance(Duration::from_millis(100));
        assert_eq!(game_loop.tick(), 2);
        assert!(game_loop.set_speed(f64::NAN).is_err());
    }

    #[test]
    fn stop_cancels_the_pending_frame() {
        let (mut game_loop, rec) = looped(10);
        game_loop.start();
        let handle = game_loop.scheduler_mut().fire().unwrap();
        game_loop.stop();
        assert!(!game_loop.is_running());
        assert_eq!(game_loop.scheduler().pending_len(), 0);

        game_loop.scheduler_mut().advance(Duration::from_millis(250));
        assert_eq!(game_loop.on_frame(handle), 0);
        assert_eq!(game_loop.tick(), 0);
        assert!(rec.alphas.borrow().is_empty());
    }

    #[test]
    fn each_frame_requests_the_next() {
        let (mut game_loop, _rec) = looped(30);
        game_loop.start();
        for _ in 0..3 {
            let handle = game_loop.scheduler_mut().fire().unwrap();
            game_loop.on_frame(handle);
            assert_eq!(game_loop.scheduler().pending_len(), 1);
        }
    }

    #[test]
    fn system_scheduler_tracks_one_pending_frame() {
        let mut scheduler = SystemScheduler::new();
        let first = scheduler.request_frame();
        let second = scheduler.request_frame();
        assert_ne!(first, second);
        scheduler.cancel_frame(first);
        assert_eq!(scheduler.pending(), Some(second));
        scheduler.cancel_frame(second);
        assert_eq!(scheduler.pending(), None);
    }
}
