//! Periodic sweep of auto-mode zones
//!
//! Every tick steps each zone that is in auto mode, attached to a
//! process, not blocked and not delayed into the future. The tick
//! interval adapts: back to the target interval whenever a zone moved,
//! doubling up to the maximum while nothing does. A second, slower
//! ticker sweeps blocked zones too. Zones can also be checked at once,
//! for example right after a group change attached them to a process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::shutdown::ShutdownCoordinator;
use super::Engine;
use crate::config::IntervalConfig;
use crate::store::{FsmMode, FsmStatus, Zone};

/// Handle for asking the scheduler to look at a zone
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<String>,
    interval: Arc<AtomicU64>,
}

impl SchedulerHandle {
    pub fn new(cfg: &IntervalConfig) -> (SchedulerHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            tx,
            interval: Arc::new(AtomicU64::new(cfg.target().as_secs())),
        };
        (handle, rx)
    }

    /// Steps `zone` as soon as the scheduler gets to it.
    pub fn check_now(&self, zone: &str) {
        if self.tx.send(zone.to_string()).is_err() {
            log::debug!("Scheduler not running, {} waits for an explicit step", zone);
        }
    }

    /// The current sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.load(Ordering::Relaxed))
    }
}

/// The interval after a sweep in which `stepped` zones moved.
pub fn next_interval(current: Duration, stepped: usize, cfg: &IntervalConfig) -> Duration {
    if stepped > 0 {
        cfg.target().max(cfg.minimum()).min(cfg.maximum())
    } else {
        (current * 2).min(cfg.maximum())
    }
}

/// Whether a sweep may step `zone` now.
pub fn eligible(zone: &Zone) -> bool {
    if zone.fsmmode != FsmMode::Auto || !zone.in_process() {
        return false;
    }
    match (zone.fsmstatus, zone.delay_until) {
        (FsmStatus::Delayed, Some(until)) => until <= Utc::now(),
        _ => true,
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

enum Event {
    Sweep { include_blocked: bool },
    Check(Option<String>),
    Shutdown,
}

/// Spawns the scheduler task. It holds the engine weakly and ends once
/// the engine is gone or shutdown is signalled.
pub(crate) fn spawn(engine: &Arc<Engine>, checks: mpsc::UnboundedReceiver<String>, shutdown: Option<&ShutdownCoordinator>) {
    let weak = Arc::downgrade(engine);
    let cfg = engine.config().intervals.clone();
    let current = engine.scheduler().interval.clone();
    let signal = shutdown.map(|s| s.subscribe());
    let guard = shutdown.map(|s| s.register_worker());

    log::info!(
        "Scheduler started: target {}s, minimum {}s, maximum {}s, complete sweep every {}s",
        cfg.target,
        cfg.minimum,
        cfg.maximum,
        cfg.complete
    );
    tokio::spawn(async move {
        run(weak, cfg, current, checks, signal).await;
        drop(guard);
    });
}

async fn run(
    engine: Weak<Engine>,
    cfg: IntervalConfig,
    current: Arc<AtomicU64>,
    mut checks: mpsc::UnboundedReceiver<String>,
    mut shutdown: Option<broadcast::Receiver<()>>,
) {
    let mut period = cfg.target();
    let mut main = ticker(period);
    let mut complete = ticker(cfg.complete());

    loop {
        let event = match shutdown.as_mut() {
            Some(signal) => tokio::select! {
                _ = main.tick() => Event::Sweep { include_blocked: false },
                _ = complete.tick() => Event::Sweep { include_blocked: true },
                zone = checks.recv() => Event::Check(zone),
                _ = signal.recv() => Event::Shutdown,
            },
            None => tokio::select! {
                _ = main.tick() => Event::Sweep { include_blocked: false },
                _ = complete.tick() => Event::Sweep { include_blocked: true },
                zone = checks.recv() => Event::Check(zone),
            },
        };

        let engine = match engine.upgrade() {
            Some(engine) => engine,
            None => break,
        };
        match event {
            Event::Sweep { include_blocked } => {
                let stepped = sweep(&engine, include_blocked).await;
                if include_blocked {
                    continue;
                }
                let next = next_interval(period, stepped, &cfg);
                if next != period {
                    log::info!("Scheduler interval {}s -> {}s", period.as_secs(), next.as_secs());
                    period = next;
                    main = ticker(period);
                    current.store(period.as_secs(), Ordering::Relaxed);
                }
            }
            Event::Check(Some(zone)) => check(&engine, &zone).await,
            Event::Check(None) | Event::Shutdown => break,
        }
    }
    log::info!("Scheduler stopped");
}

/// Steps every eligible zone once. Returns how many changed state.
async fn sweep(engine: &Arc<Engine>, include_blocked: bool) -> usize {
    let zones = match engine.store().schedulable_zones(None, include_blocked).await {
        Ok(zones) => zones,
        Err(e) => {
            log::error!("Scheduler could not load zones: {}", e);
            return 0;
        }
    };

    let mut stepped = 0;
    let mut waiting = 0;
    for zone in zones.iter().filter(|z| eligible(z)) {
        match engine.step(&zone.name, None).await {
            Ok((true, msg)) => {
                log::info!("{}", msg);
                stepped += 1;
            }
            Ok((false, msg)) => {
                log::debug!("{}", msg);
                waiting += 1;
            }
            Err(e) => log::warn!("Scheduler could not step {}: {}", zone.name, e),
        }
    }
    log::debug!(
        "Sweep{}: {} zone(s) stepped, {} waiting",
        if include_blocked { " (all)" } else { "" },
        stepped,
        waiting
    );
    stepped
}

async fn check(engine: &Arc<Engine>, name: &str) {
    let zone = match engine.store().get_zone(None, name).await {
        Ok(zone) => zone,
        Err(e) => {
            log::warn!("Scheduler check of {}: {}", name, e);
            return;
        }
    };
    if !eligible(&zone) {
        return;
    }
    match engine.step(name, None).await {
        Ok((_, msg)) => log::info!("{}", msg),
        Err(e) => log::warn!("Scheduler could not step {}: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ZoneType;

    fn cfg() -> IntervalConfig {
        IntervalConfig {
            target: 60,
            minimum: 15,
            maximum: 300,
            complete: 3600,
        }
    }

    #[test]
    fn test_interval_backs_off_when_idle() {
        let cfg = cfg();
        let mut current = cfg.target();
        let mut seen = Vec::new();
        for _ in 0..4 {
            current = next_interval(current, 0, &cfg);
            seen.push(current.as_secs());
        }
        assert_eq!(seen, vec![120, 240, 300, 300]);
    }

    #[test]
    fn test_interval_resets_on_progress() {
        let cfg = cfg();
        assert_eq!(next_interval(Duration::from_secs(300), 3, &cfg), Duration::from_secs(60));
        assert_eq!(next_interval(Duration::from_secs(15), 1, &cfg), Duration::from_secs(60));
    }

    fn zone(status: FsmStatus, delay: Option<i64>) -> Zone {
        Zone {
            name: "example.com.".to_string(),
            zonetype: ZoneType::Normal,
            state: "signers-unsynced".to_string(),
            statestamp: Utc::now(),
            fsm: "add-signer".to_string(),
            fsmsigner: "s2".to_string(),
            fsmmode: FsmMode::Auto,
            fsmstatus: status,
            sgroup: "gA".to_string(),
            stop_reason: String::new(),
            delay_reason: String::new(),
            delay_until: delay.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }

    #[test]
    fn test_eligible() {
        assert!(eligible(&zone(FsmStatus::Ok, None)));
        assert!(eligible(&zone(FsmStatus::Blocked, None)));
        assert!(!eligible(&zone(FsmStatus::Delayed, Some(600))));
        assert!(eligible(&zone(FsmStatus::Delayed, Some(-1))));

        let mut manual = zone(FsmStatus::Ok, None);
        manual.fsmmode = FsmMode::Manual;
        assert!(!eligible(&manual));

        let mut idle = zone(FsmStatus::Ok, None);
        idle.fsm.clear();
        assert!(!eligible(&idle));
    }
}
