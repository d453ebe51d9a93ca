//! Main control loop.
//!
//! Two cadences share one task:
//! - the sensor cycle (`sample_every_s`): acquire, evaluate, actuate on
//!   demand, then publish the reading and any alerts;
//! - the tick (`tick_ms`): enforce the pump timeout.
//!
//! The connection is driven by its own task ([`Session::run`]); this loop only
//! receives the commands it forwards and publishes through a [`Link`].
//! Nothing here waits on the broker, so the pump timeout is serviced on
//! schedule during any outage.
//!
//! [`Session::run`]: crate::session::Session::run

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::actuator::{Actuator, Cause};
use crate::command::Command;
use crate::config::TimingSection;
use crate::relay::Relay;
use crate::sensor::{Acquisition, SensorHardware};
use crate::session::Link;
use crate::telemetry::{Publish, Telemetry};
use crate::thresholds::{evaluate, Evaluation, Thresholds};

pub struct Controller<H, R> {
    acquisition: Acquisition<H>,
    thresholds: Thresholds,
    actuator: Actuator<R>,
    telemetry: Telemetry,
    sample_every: Duration,
    tick: Duration,
}

impl<H: SensorHardware, R: Relay> Controller<H, R> {
    pub fn new(
        acquisition: Acquisition<H>,
        thresholds: Thresholds,
        actuator: Actuator<R>,
        telemetry: Telemetry,
        timing: &TimingSection,
    ) -> Self {
        Self {
            acquisition,
            thresholds,
            actuator,
            telemetry,
            sample_every: timing.sample_every(),
            tick: timing.tick(),
        }
    }

    /// Run until `shutdown` resolves, then turn the pump off.
    pub async fn run(
        &mut self,
        link: &Link,
        commands: &mut mpsc::Receiver<Command>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sample = interval(self.sample_every);
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            sample_every_sec = self.sample_every.as_secs(),
            tick_ms = self.tick.as_millis() as u64,
            "control loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    self.actuator.turn_off(Instant::now(), Cause::Shutdown);
                    info!("control loop stopped");
                    return;
                }
                _ = tick.tick() => self.on_tick(Instant::now()),
                _ = sample.tick() => {
                    self.sensor_cycle(link, Instant::now());
                }
                Some(cmd) = commands.recv() => self.dispatch(cmd, Instant::now()),
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        self.actuator.check_timeout(now);
        self.acquisition.observe_pump(self.actuator.is_running());
    }

    /// One sensor cycle.  Actuation happens before publishing so a dead
    /// broker can never delay it.
    pub fn sensor_cycle(&mut self, sink: &impl Publish, now: Instant) -> Evaluation {
        let reading = self.acquisition.acquire();
        info!(
            moisture = reading.soil_moisture,
            temperature = reading.air_temperature,
            humidity = reading.air_humidity,
            lux = reading.light_intensity,
            "reading acquired"
        );

        let eval = evaluate(&reading, &self.thresholds);
        if eval.irrigation_demand {
            self.actuator.turn_on(now, Cause::Demand);
        }

        if let Err(e) = self.telemetry.publish_reading(sink, &reading) {
            warn!("reading not published: {e:#}");
        }
        for alert in &eval.alerts {
            warn!(alert = alert.kind(), value = alert.value(), "threshold crossed");
            if let Err(e) = self.telemetry.publish_alert(sink, alert) {
                warn!(alert = alert.kind(), "alert not published: {e:#}");
            }
        }

        eval
    }

    /// Apply a remote command to the pump.
    pub fn dispatch(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::PumpOn => {
                self.actuator.turn_on(now, Cause::Command);
            }
            Command::PumpOff => {
                self.actuator.turn_off(now, Cause::Command);
            }
            Command::Unknown(raw) => {
                warn!(payload = %raw, "unknown command ignored");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn actuator(&self) -> &Actuator<R> {
        &self.actuator
    }
}

// ===========================================================================
// Tests
// ===========================================================================
