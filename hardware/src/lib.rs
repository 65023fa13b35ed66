//! Hardware access layer for the turret.
//!
//! The turret core never touches a device directly; everything flows
//! through the [`GpioBackend`] capability set. Two backends exist:
//!
//! - [`RpiGpio`] (feature `raspi`): the Raspberry Pi header via `rppal`,
//!   with hardware PWM on BCM 12/13/18/19.
//! - [`MockGpio`]: an in-memory pin map with scripted edge injection and
//!   recorded PWM history, used by every test suite.
//!
//! The [`tmc2209`] module covers the UART-configured stepper driver path
//! where microstep selection moves off the MS pins.

pub mod gpio;
pub mod mock;
#[cfg(feature = "raspi")]
pub mod rpi;
pub mod tmc2209;

pub use gpio::{
    EdgeHandler, EdgeKind, GpioBackend, GpioError, GpioResult, Level, Pin, PinMode, PwmChannel,
    Pull,
};
pub use mock::{MockGpio, MockPwmState};
#[cfg(feature = "raspi")]
pub use rpi::RpiGpio;

use std::sync::Arc;

/// Select the process-wide GPIO backend.
///
/// With `mock` set (or when the `raspi` feature is compiled out) the
/// in-memory backend is returned; otherwise the Raspberry Pi peripheral is
/// opened. The caller holds the returned `Arc` for the life of the process
/// and tears it down through [`GpioBackend::cleanup`].
pub fn backend(mock: bool) -> GpioResult<Arc<dyn GpioBackend>> {
    #[cfg(feature = "raspi")]
    {
        if !mock {
            return Ok(Arc::new(RpiGpio::new()?));
        }
    }
    let _ = mock;
    Ok(Arc::new(MockGpio::new()))
}
