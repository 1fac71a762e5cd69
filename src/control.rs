//! Fixed-rate control loop thread
//!
//! The loop owns the [`Plant`] and runs one tick per period on a dedicated
//! thread. Its only cancellation point is the top of each tick. When it exits,
//! for whatever reason, it tells the field-bus server to stop as well.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::SimulationConfig;
use crate::error::PlantError;
use crate::plant::{Plant, PlantStats};
use crate::registers::Tag;

struct ShutdownInner {
    stop: AtomicBool,
    fieldbus: watch::Sender<bool>,
}

/// Stop signals shared by the control loop, the field-bus server and `main`
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (fieldbus, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                stop: AtomicBool::new(false),
                fieldbus,
            }),
        }
    }

    /// Ask the control loop to stop at the top of its next tick
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Tell the field-bus server to shut down
    pub fn stop_fieldbus(&self) {
        self.inner.fieldbus.send_replace(true);
    }

    pub fn is_fieldbus_stopped(&self) -> bool {
        *self.inner.fieldbus.borrow()
    }

    /// Resolves once [`Shutdown::stop_fieldbus`] has been called
    pub async fn fieldbus_stopped(&self) {
        let mut stopped = self.inner.fieldbus.subscribe();
        // The sender lives as long as `self`, so this only returns on a stop
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// How ticks are spaced in wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// One tick per period, best effort
    RealTime { period: Duration },
    /// As fast as possible (batch runs, tests)
    Unpaced,
}

impl Pacing {
    pub fn from_config(sim: &SimulationConfig) -> Self {
        if sim.realtime {
            Pacing::RealTime {
                period: sim.tick_period(),
            }
        } else {
            Pacing::Unpaced
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    TickLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::TickLimit => write!(f, "tick limit reached"),
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub stats: PlantStats,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {:.1}s: {}",
            self.reason,
            self.elapsed.as_secs_f64(),
            self.stats
        )
    }
}

pub struct ControlLoop {
    plant: Plant,
    shutdown: Shutdown,
    pacing: Pacing,
    max_ticks: Option<u64>,
    status_interval: u64,
}

impl ControlLoop {
    pub fn new(plant: Plant, shutdown: Shutdown, sim: &SimulationConfig) -> Self {
        Self {
            plant,
            shutdown,
            pacing: Pacing::from_config(sim),
            max_ticks: sim.max_ticks,
            status_interval: sim.status_interval_ticks,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: Option<u64>) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    /// Tick until stopped, a tick limit or a simulation fault
    ///
    /// The field-bus server is told to stop on every exit path.
    pub fn run(&mut self) -> Result<RunSummary, PlantError> {
        let started = Instant::now();
        let mut deadline = started;

        log::info!("Control loop started ({:?})", self.pacing);

        let outcome = loop {
            if self.shutdown.is_stop_requested() {
                break Ok(StopReason::Requested);
            }
            if self.max_ticks.is_some_and(|max| self.plant.ticks() >= max) {
                break Ok(StopReason::TickLimit);
            }

            if let Err(e) = self.plant.tick() {
                break Err(e);
            }
            self.log_status();

            if let Pacing::RealTime { period } = self.pacing {
                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else if now - deadline > period {
                    // Fell behind by more than a tick: don't try to catch up
                    deadline = now;
                }
            }
        };

        self.shutdown.stop_fieldbus();

        match outcome {
            Ok(reason) => {
                let summary = RunSummary {
                    reason,
                    stats: self.plant.stats(),
                    elapsed: started.elapsed(),
                };
                log::info!("Control loop finished: {}", summary);
                Ok(summary)
            }
            Err(e) => {
                log::error!("Control loop aborted at tick {}: {}", self.plant.ticks(), e);
                Err(e)
            }
        }
    }

    fn log_status(&self) {
        let ticks = self.plant.ticks();
        if self.status_interval == 0 || ticks % self.status_interval != 0 {
            return;
        }
        let registers = self.plant.registers();
        log::info!(
            "Tick {} {}: LIMIT={} LEVEL={} MOTOR={} NOZZLE={} bottles={} droplets={}",
            ticks,
            self.plant.control_state(),
            registers.tag(Tag::LimitSwitch),
            registers.tag(Tag::LevelSensor),
            registers.tag(Tag::Motor),
            registers.tag(Tag::Nozzle),
            self.plant.bottles().len(),
            self.plant.droplet_count()
        );
    }

    /// Run on a dedicated thread named `control-loop`
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<Result<RunSummary, PlantError>>> {
        thread::Builder::new()
            .name("control-loop".to_string())
            .spawn(move || self.run())
    }
}
