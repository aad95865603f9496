//! Watchdog
//!
//! Counts VBLANKs (or virtual time) since the last kick. Expiry is reported
//! to the machine, which schedules a soft reset at the end of the timeslice.

use serde::{Deserialize, Serialize};

use crate::config::WatchdogConfig;
use crate::error::{Result, StateError};
use crate::snapshot::StateRegistry;
use crate::time::VirtualTime;
use crate::timer::{TimerAction, TimerId, TimerQueue};

const STATE_TAG: &str = "watchdog";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogState {
    Disabled,
    /// VBLANKs left before expiry.
    Counting(u32),
    /// Waiting on the watchdog timer.
    Timer,
    Expired,
}

pub struct Watchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    timer: Option<TimerId>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, timers: &mut TimerQueue) -> Result<Self> {
        let timer = match config {
            WatchdogConfig::Time(_) => Some(timers.allocate(TimerAction::Watchdog)?),
            _ => None,
        };
        Ok(Watchdog {
            config,
            state: WatchdogState::Disabled,
            timer,
        })
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Reload the counter or restart the timer.
    pub fn kick(&mut self, timers: &mut TimerQueue, now: VirtualTime) {
        match (self.config, self.timer) {
            (WatchdogConfig::Vblank(count), _) => self.state = WatchdogState::Counting(count),
            (WatchdogConfig::Time(duration), Some(timer)) => {
                timers.adjust(timer, now + duration, 0, VirtualTime::ZERO);
                self.state = WatchdogState::Timer;
            }
            _ => self.state = WatchdogState::Disabled,
        }
    }

    pub fn enable(&mut self, timers: &mut TimerQueue, now: VirtualTime, enable: bool) {
        if enable {
            self.kick(timers, now);
        } else {
            if let Some(timer) = self.timer {
                timers.remove(timer);
            }
            self.state = WatchdogState::Disabled;
        }
    }

    /// Count one VBLANK. Returns true exactly once, when the count runs out.
    pub fn on_vblank(&mut self) -> bool {
        let WatchdogState::Counting(left) = self.state else {
            return false;
        };
        if left <= 1 {
            self.state = WatchdogState::Expired;
            tracing::info!("watchdog expired after vblank countdown");
            return true;
        }
        self.state = WatchdogState::Counting(left - 1);
        false
    }

    /// The watchdog timer fired.
    pub fn on_timer(&mut self) -> bool {
        if self.state != WatchdogState::Timer {
            return false;
        }
        self.state = WatchdogState::Expired;
        tracing::info!("watchdog timer expired");
        true
    }

    /// Rearm after a machine reset; enabled whenever configured.
    pub fn reset(&mut self, timers: &mut TimerQueue, now: VirtualTime) {
        let enabled = self.config != WatchdogConfig::Disabled;
        self.enable(timers, now, enabled);
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        registry.save_item(STATE_TAG, 0, "state", &self.state)
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        self.state = registry.load_item(STATE_TAG, 0, "state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vblank_countdown_fires_once() {
        let mut timers = TimerQueue::new();
        let mut watchdog = Watchdog::new(WatchdogConfig::Vblank(3), &mut timers).unwrap();
        watchdog.reset(&mut timers, VirtualTime::ZERO);
        assert_eq!(watchdog.state(), WatchdogState::Counting(3));

        let fired: Vec<bool> = (0..5).map(|_| watchdog.on_vblank()).collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(watchdog.state(), WatchdogState::Expired);
    }

    #[test]
    fn test_kick_reloads() {
        let mut timers = TimerQueue::new();
        let mut watchdog = Watchdog::new(WatchdogConfig::Vblank(2), &mut timers).unwrap();
        watchdog.reset(&mut timers, VirtualTime::ZERO);
        for _ in 0..10 {
            assert!(!watchdog.on_vblank());
            watchdog.kick(&mut timers, VirtualTime::ZERO);
        }
    }

    #[test]
    fn test_disabled_never_fires() {
        let mut timers = TimerQueue::new();
        let mut watchdog = Watchdog::new(WatchdogConfig::Vblank(1), &mut timers).unwrap();
        watchdog.reset(&mut timers, VirtualTime::ZERO);
        watchdog.enable(&mut timers, VirtualTime::ZERO, false);
        assert!(!watchdog.on_vblank());
        assert!(!watchdog.on_timer());
    }

    #[test]
    fn test_timer_mode_schedules_expiry() {
        let mut timers = TimerQueue::new();
        let limit = VirtualTime::from_micros(500);
        let mut watchdog = Watchdog::new(WatchdogConfig::Time(limit), &mut timers).unwrap();
        watchdog.reset(&mut timers, VirtualTime::ZERO);
        assert_eq!(timers.next_fire_time(), limit);
        assert!(!watchdog.on_vblank());

        timers.set_global_time(limit);
        let fired = timers.pop_due().unwrap();
        assert_eq!(fired.action, TimerAction::Watchdog);
        assert!(watchdog.on_timer());
        assert!(!watchdog.on_timer());
    }
}
