//! # Cortex-M Port
//!
//! The kernel needs very little from the hardware: a millisecond clock for
//! delays and time slices, and a way to sleep when no task is ready. Tasks
//! never switch stacks, so the port needs no context-switch code.
//!
//! SysTick is programmed for `TICK_HZ` and its handler calls [`on_systick`],
//! which advances [`SysTickClock`].

use core::cell::Cell;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;
use critical_section::Mutex;

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::scheduler::Clock;

static MILLIS: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

/// Configure SysTick to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
    log::info!("systick: {TICK_HZ} Hz, reload {reload}");
}

/// Advance the millisecond counter. Call once per SysTick interrupt.
pub fn on_systick() {
    critical_section::with(|cs| {
        let millis = MILLIS.borrow(cs);
        millis.set(millis.get().wrapping_add(1000 / TICK_HZ));
    });
}

/// Milliseconds since [`configure_systick`], wrapping.
pub fn millis() -> u32 {
    critical_section::with(|cs| MILLIS.borrow(cs).get())
}

/// [`Clock`] over the SysTick counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysTickClock;

impl Clock for SysTickClock {
    fn now_ms(&self) -> u32 {
        millis()
    }
}

/// Sleep until the next interrupt.
#[inline]
pub fn idle() {
    cortex_m::asm::wfi();
}
