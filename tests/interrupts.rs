mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{burners, config};
use lockstep::interrupts::InterruptCallback;
use lockstep::machine::ResetHook;
use lockstep::{MachineBus, SuspendReason, TimedInterruptRate, VirtualTime, WatchdogConfig};

fn counter(count: &Rc<Cell<u32>>) -> InterruptCallback {
    let count = count.clone();
    Rc::new(move |_: &mut MachineBus<'_>, _: usize| count.set(count.get() + 1))
}

#[test]
fn test_vblank_interrupts_follow_per_cpu_rates() {
    let once = Rc::new(Cell::new(0));
    let four = Rc::new(Cell::new(0));
    let mut cfg = config(&[1_000_000, 1_000_000]);
    cfg.cpus[0] = cfg.cpus[0].clone().with_vblank_interrupt(1, counter(&once));
    cfg.cpus[1] = cfg.cpus[1].clone().with_vblank_interrupt(4, counter(&four));
    let (mut machine, _) = burners(cfg);
    assert_eq!(machine.interrupts().pulses_per_frame(), 4);

    for _ in 0..3 {
        machine.run_frame();
    }
    assert_eq!(machine.interrupts().current_frame(), 3);
    assert_eq!(once.get(), 3);
    assert_eq!(four.get(), 12);
}

#[test]
fn test_callbacks_see_interrupts_left_in_frame() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    let record: InterruptCallback = Rc::new(move |bus: &mut MachineBus<'_>, _: usize| {
        log.borrow_mut().push((bus.iloops(), bus.current_frame()))
    });
    let mut cfg = config(&[1_000_000]);
    cfg.cpus[0] = cfg.cpus[0].clone().with_vblank_interrupt(4, record);
    let (mut machine, _) = burners(cfg);

    machine.run_frame();
    machine.run_frame();
    let seen = seen.borrow();
    let iloops: Vec<i32> = seen.iter().map(|&(left, _)| left).collect();
    assert_eq!(iloops, vec![3, 2, 1, 0, 3, 2, 1, 0]);
    // the VBLANK interrupt still belongs to the frame it ends
    assert_eq!(seen[3].1, 0);
    assert_eq!(seen[7].1, 1);
    assert_eq!(machine.bus(0).iloops(), 3);
}

#[test]
fn test_disabled_cpu_gets_no_vblank_interrupt() {
    let taken = Rc::new(Cell::new(0));
    let mut cfg = config(&[1_000_000, 1_000_000]);
    cfg.cpus[1] = cfg.cpus[1].clone().with_vblank_interrupt(1, counter(&taken));
    cfg.cpus[1].start_disabled = true;
    let (mut machine, recorders) = burners(cfg);

    machine.run_frame();
    machine.run_frame();
    assert_eq!(taken.get(), 0);
    assert!(recorders[1].budgets.borrow().is_empty());

    machine.bus(0).resume(1, SuspendReason::DISABLE);
    machine.run_frame();
    assert_eq!(taken.get(), 1);
}

#[test]
fn test_watchdog_resets_machine_without_kicks() {
    let mut cfg = config(&[1_000_000]);
    cfg.watchdog = WatchdogConfig::Vblank(3);
    let (mut machine, recorders) = burners(cfg);
    let resets = Rc::new(Cell::new(0));
    let seen = resets.clone();
    let hook: ResetHook = Rc::new(move |_: &mut MachineBus<'_>| seen.set(seen.get() + 1));
    machine.set_reset_hook(hook);

    machine.run_frame();
    machine.run_frame();
    assert_eq!(resets.get(), 0);
    machine.run_frame();
    assert_eq!(resets.get(), 1);
    assert_eq!(recorders[0].resets.get(), 2);

    for _ in 0..3 {
        machine.run_frame();
    }
    assert_eq!(resets.get(), 2);
}

#[test]
fn test_kicked_watchdog_never_fires() {
    let mut cfg = config(&[1_000_000]);
    cfg.watchdog = WatchdogConfig::Vblank(2);
    let kick: InterruptCallback = Rc::new(|bus: &mut MachineBus<'_>, _: usize| bus.watchdog_kick());
    cfg.cpus[0] = cfg.cpus[0].clone().with_vblank_interrupt(1, kick);
    let (mut machine, recorders) = burners(cfg);

    for _ in 0..10 {
        machine.run_frame();
    }
    assert_eq!(recorders[0].resets.get(), 1);
}

#[test]
fn test_time_watchdog_expires_after_its_period() {
    let mut cfg = config(&[1_000_000]);
    cfg.watchdog = WatchdogConfig::Time(VirtualTime::from_micros(5000));
    let (mut machine, recorders) = burners(cfg);

    machine.run_for(VirtualTime::from_micros(4000));
    assert_eq!(recorders[0].resets.get(), 1);
    machine.run_for(VirtualTime::from_micros(2000));
    assert_eq!(recorders[0].resets.get(), 2);
}

#[test]
fn test_timed_interrupts_by_rate_and_period() {
    let per_frame = Rc::new(Cell::new(0));
    let per_ms = Rc::new(Cell::new(0));
    let mut cfg = config(&[1_000_000, 1_000_000]);
    let eight = TimedInterruptRate::from_raw(8).unwrap();
    let millisecond = TimedInterruptRate::from_raw(1_000_000).unwrap();
    assert_eq!(millisecond, TimedInterruptRate::PeriodNanos(1_000_000));
    cfg.cpus[0] = cfg.cpus[0].clone().with_timed_interrupt(eight, counter(&per_frame));
    cfg.cpus[1] = cfg.cpus[1].clone().with_timed_interrupt(millisecond, counter(&per_ms));
    let (mut machine, _) = burners(cfg);

    machine.run_frame();
    assert_eq!(per_frame.get(), 8);
    assert_eq!(per_ms.get(), 16);
}

#[test]
fn test_screen_updates_after_blanking() {
    let mut cfg = config(&[1_000_000]);
    cfg.vblank_duration = VirtualTime::from_micros(2500);
    cfg.update_after_vblank = true;
    let (mut machine, _) = burners(cfg);
    let updates = Rc::new(RefCell::new(Vec::new()));
    let log = updates.clone();
    machine.set_screen_update(Rc::new(move |bus: &mut MachineBus<'_>, frame: u64| {
        log.borrow_mut().push((frame, bus.now(), bus.in_vblank()))
    }));
    let frame = machine.interrupts().frame_period();
    assert_eq!(machine.bus(0).time_until_vblank_start(), frame - VirtualTime::from_micros(2500));

    machine.run_frame();
    assert!(machine.interrupts().in_vblank());
    assert!(updates.borrow().is_empty());

    machine.run_for(VirtualTime::from_micros(3000));
    machine.run_frame();
    machine.run_frame();
    machine.run_for(VirtualTime::from_micros(3000));

    let updates = updates.borrow();
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[0], (1, frame, false));
    assert_eq!(updates[2].0, 3);
}
