//! # Demo Firmware
//!
//! Two tasks share one bus controller:
//!
//! | Task | Kind | Behavior |
//! |------|------|----------|
//! | `Heartbeat` | plain [`Task`] | Writes an LED pattern every 500 ms, retrying when the controller is full |
//! | sensor | [`AsyncTask`] | Selects a register, reads two bytes into a private buffer, waits for the completion signal, sleeps 1 s |
//!
//! There is no real TWI peripheral behind the controller: `LoopbackBus`
//! drains transmit requests and fills receive requests with a counting
//! pattern, and the SysTick handler retires whatever is in flight on the next
//! tick. Swapping in a real [`RequestProcessor`] plus a bus interrupt that
//! calls `end_processing_request` is all it takes to drive hardware.

#![no_std]
#![no_main]

use core::pin::pin;

use cortex_m_rt::{entry, exception};
use panic_halt as _;

use coop_rtos::arch::cortex_m::{self as port, SysTickClock};
use coop_rtos::config::DEFAULT_TIME_SLICE_MS;
use coop_rtos::sync::Shared;
use coop_rtos::{
    AsyncTask, Completion, Controller, Kernel, RequestProcessor, ReserveError, Scheduler, Signal,
    StreamRef, SubmitError, Task,
};

const LED_DRIVER: u8 = 0x60;
const SENSOR: u8 = 0x48;
const TEMP_REG: u8 = 0x00;

// ---------------------------------------------------------------------------
// Shared objects
// ---------------------------------------------------------------------------

/// Stand-in for a TWI peripheral.
struct LoopbackBus;

impl RequestProcessor for LoopbackBus {
    fn start_processing_request(&self, request: &mut StreamRef<'_>) {
        if request.is_receive() {
            let mut pattern = 0u8;
            while request.remaining() > 0 && request.bytes().add_tail(pattern) {
                pattern = pattern.wrapping_add(1);
            }
        } else {
            let mut bytes = request.bytes();
            while bytes.remove_head().is_some() {}
        }
    }
}

static KERNEL: Kernel = Kernel::new();
static BUS: Controller<LoopbackBus, 4, 64> = Controller::new(LoopbackBus);
static SAMPLE_READY: Signal = Signal::new();
static LAST_SAMPLE: Shared<u16> = Shared::new(0);
/// The sensor's receive buffer while no read is in flight.
static SPARE: Shared<Option<&'static mut [u8]>> = Shared::new(None);

fn sample_done(request: &mut StreamRef<'_>, _: usize) {
    let mut raw = [0u8; 2];
    if request.error().is_none() && request.bytes().read_into(&mut raw) == raw.len() {
        LAST_SAMPLE.lock(|s| *s = u16::from_be_bytes(raw));
    }
    let buffer = request.take_buffer();
    SPARE.lock(|s| *s = buffer);
    SAMPLE_READY.raise(&KERNEL);
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

struct Heartbeat {
    level: u8,
}

impl Task for Heartbeat {
    fn run(&mut self, kernel: &Kernel) {
        let Some(me) = kernel.current() else {
            return;
        };
        match BUS.process_stream(kernel, me, LED_DRIVER, &[0x01, self.level], None) {
            Ok(_) => {
                self.level ^= 0xFF;
                let _ = kernel.delay(500);
            }
            // Suspended by the controller, resumed once there is room.
            Err(SubmitError::Reserve(ReserveError::WouldBlock)) => {}
            Err(e) => {
                log::error!("heartbeat: {e}");
                let _ = kernel.delay(500);
            }
        }
    }
}

async fn read_temperature() -> Result<(), SubmitError> {
    BUS.process_stream_async(&KERNEL, SENSOR, &[TEMP_REG], None)
        .await?;
    let me = KERNEL.current().ok_or(ReserveError::NoCurrentTask)?;
    let Some(buffer) = SPARE.lock(|s| s.take()) else {
        return Ok(());
    };
    if let Err(e) = BUS.reserve_async(&KERNEL, 1, 0).await {
        SPARE.lock(|s| *s = Some(buffer));
        return Err(e.into());
    }
    let done = Completion::new(sample_done, 0);
    match BUS.submit_read(&KERNEL, me, SENSOR, buffer, 2, Some(done)) {
        Ok(_) => {
            let _ = SAMPLE_READY.wait_async(&KERNEL).await;
            Ok(())
        }
        Err((e, buffer)) => {
            BUS.cancel_reservation(&KERNEL, me);
            SPARE.lock(|s| *s = Some(buffer));
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Entry and interrupts
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(mut cp) = cortex_m::Peripherals::take() else {
        loop {
            port::idle();
        }
    };
    port::configure_systick(&mut cp.SYST);

    if let Some(buffer) = cortex_m::singleton!(: [u8; 3] = [0; 3]) {
        SPARE.lock(|s| *s = Some(buffer));
    }

    let mut heartbeat = Heartbeat { level: 0x0F };
    let sensor_body = pin!(async {
        loop {
            if let Err(e) = read_temperature().await {
                log::warn!("sensor: {e}");
            }
            KERNEL.yield_resume(1000).await;
        }
    });
    let mut sensor = AsyncTask::new(sensor_body);

    let mut tasks: [&mut dyn Task; 2] = [&mut heartbeat, &mut sensor];
    let Ok(mut scheduler) = Scheduler::new(&KERNEL, SysTickClock, &mut tasks) else {
        loop {
            port::idle();
        }
    };
    scheduler.begin();

    loop {
        if scheduler.dispatch(DEFAULT_TIME_SLICE_MS) == 0 {
            port::idle();
        }
    }
}

#[exception]
fn SysTick() {
    port::on_systick();
    if BUS.with_processing_stream(|_| ()).is_some() {
        BUS.end_processing_request(&KERNEL, Ok(()));
    }
}
